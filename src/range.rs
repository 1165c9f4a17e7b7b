use itertools::Itertools;
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{borrow::Borrow, fmt};

/// Range where lower bound is inclusive, upper bound is exclusive or unbounded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range<T>(T, Option<T>);

impl<T> Range<T>
where
    T: Ord + fmt::Display,
{
    pub fn new(from: T, to: Option<T>) -> Result<Self> {
        if let Some(ref to) = to {
            ensure!(from < *to, "range {} - {} goes from high to low", from, to);
        }
        Ok(Range(from, to))
    }

    pub fn contains(&self, val: &T) -> bool {
        match &self.1 {
            Some(end) => val >= &self.0 && val < end,
            None => val >= &self.0,
        }
    }
}

impl<T> fmt::Display for Range<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(end) = &self.1 {
            write!(f, "{} - {}", self.0, end)
        } else {
            write!(f, "{}+", self.0)
        }
    }
}

/// An ordered list of ranges. A value falls into the first range that contains it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeSet<T> {
    ranges: Vec<Range<T>>,
}

impl RangeSet<u32> {
    /// Contiguous bands `[b0, b1), [b1, b2), ..., [bn, ∞)`.
    pub fn from_bounds(bounds: &[u32]) -> Result<Self> {
        ensure!(!bounds.is_empty(), "need at least one bound");
        let mut ranges = bounds
            .iter()
            .tuple_windows()
            .map(|(from, to)| Range::new(*from, Some(*to)))
            .collect::<Result<Vec<_>>>()?;
        // checked non-empty above
        ranges.push(Range(bounds[bounds.len() - 1], None));
        Ok(Self { ranges })
    }

    /// Twenty-year bands up to 80, then everyone older.
    pub fn default_ages() -> Self {
        Self {
            ranges: vec![
                Range(0, Some(18)),
                Range(18, Some(40)),
                Range(40, Some(60)),
                Range(60, Some(80)),
                Range(80, None),
            ],
        }
    }
}

impl<T> RangeSet<T> {
    pub fn iter(&self) -> impl Iterator<Item = &Range<T>> + '_ {
        self.ranges.iter()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl<T> RangeSet<T>
where
    T: Ord + fmt::Display,
{
    /// The index of the range holding `value`, if any.
    pub fn find(&self, value: &T) -> Option<usize> {
        self.ranges.iter().position(|range| range.contains(value))
    }

    pub fn bucket_values<I, B>(&self, values: I) -> RangeSetCounts<T>
    where
        I: IntoIterator<Item = B>,
        B: Borrow<T>,
        T: Clone,
    {
        let mut counts = vec![0usize; self.ranges.len()];
        let mut outside = 0;
        for value in values {
            match self.find(value.borrow()) {
                Some(idx) => counts[idx] += 1,
                None => outside += 1,
            }
        }
        RangeSetCounts {
            set: self.clone(),
            counts,
            outside,
        }
    }

    /// Like `bucket_values`, but `None` values are counted separately as missing.
    pub fn bucket_values_with_missing<I, B>(&self, values: I) -> RangeSetCountsWithMissing<T>
    where
        I: IntoIterator<Item = Option<B>>,
        B: Borrow<T>,
        T: Clone,
    {
        let mut missing = 0;
        let counts = self.bucket_values(values.into_iter().filter_map(|v| {
            if v.is_none() {
                missing += 1;
            }
            v
        }));
        RangeSetCountsWithMissing { counts, missing }
    }
}

/// A range set with values bucketed, and bucket sizes recorded.
#[derive(Debug, Clone)]
pub struct RangeSetCounts<T> {
    set: RangeSet<T>,
    counts: Vec<usize>,
    /// Values no range contained.
    outside: usize,
}

impl<T> RangeSetCounts<T> {
    pub fn iter(&self) -> impl Iterator<Item = (&Range<T>, usize)> {
        self.set.iter().zip_eq(self.counts.iter().copied())
    }

    pub fn outside(&self) -> usize {
        self.outside
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum::<usize>() + self.outside
    }
}

/// A range set with values bucketed, and the number of missing values recorded.
#[derive(Debug, Clone)]
pub struct RangeSetCountsWithMissing<T> {
    counts: RangeSetCounts<T>,
    missing: usize,
}

impl<T> RangeSetCountsWithMissing<T> {
    /// Each range with its count, followed by `(None, missing)`.
    pub fn iter(&self) -> impl Iterator<Item = (Option<&Range<T>>, usize)> {
        self.counts
            .iter()
            .map(|(range, count)| (Some(range), count))
            .chain(std::iter::once((None, self.missing)))
    }

    pub fn missing(&self) -> usize {
        self.missing
    }

    pub fn counts(&self) -> &RangeSetCounts<T> {
        &self.counts
    }
}

impl<T> RangeSetCountsWithMissing<T>
where
    T: fmt::Display,
{
    /// Labelled rows: one per range, then "outside ranges" (only if any value fell outside
    /// every range), then "missing data". The counts add up to every value bucketed.
    pub fn for_display(&self) -> impl Iterator<Item = (String, usize)> + '_ {
        let outside = self.counts.outside();
        let ranges = self
            .counts
            .iter()
            .map(|(range, count)| (range.to_string(), count));
        let outside = (outside > 0).then(|| ("outside ranges".to_string(), outside));
        ranges
            .chain(outside)
            .chain(std::iter::once(("missing data".to_string(), self.missing)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bounds() {
        let set = RangeSet::from_bounds(&[0, 18, 65]).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.find(&17), Some(0));
        assert_eq!(set.find(&18), Some(1));
        assert_eq!(set.find(&90), Some(2));
        assert!(RangeSet::from_bounds(&[18, 0]).is_err());
        assert!(Range::new(5u32, Some(5)).is_err());
    }

    #[test]
    fn bucketing() {
        let set = RangeSet::from_bounds(&[10, 20]).unwrap();
        let counts = set.bucket_values_with_missing([Some(5u32), Some(12), None, Some(25), Some(19)]);
        let rows: Vec<_> = counts.for_display().collect();
        assert_eq!(
            rows,
            [
                ("10 - 20".to_string(), 2),
                ("20+".to_string(), 1),
                ("outside ranges".to_string(), 1),
                ("missing data".to_string(), 1)
            ]
        );
        assert_eq!(counts.counts().outside(), 1);
        assert_eq!(counts.counts().total(), 4);
        let shown: usize = counts.for_display().map(|(_, count)| count).sum();
        assert_eq!(shown, 5);
    }

    #[test]
    fn no_outside_row_when_everything_fits() {
        let counts = RangeSet::default_ages().bucket_values_with_missing([Some(3u32), None]);
        let labels: Vec<_> = counts.for_display().map(|(label, _)| label).collect();
        assert!(!labels.iter().any(|label| label == "outside ranges"));
        assert_eq!(labels.last().map(String::as_str), Some("missing data"));
    }
}
