//! Histogram bucket layouts
//!
//! A layout with `n` finite buckets resolves to `n + 2` buckets: index 0 is the
//! underflow bucket `(-inf, b[0])`, index `N - 1` is the overflow bucket
//! `[b[N - 2], +inf)`, and bucket `i` in between covers `[b[i - 1], b[i])`.

use serde::Serialize;

/// Backend limit on buckets per distribution, underflow and overflow included
pub const MAX_BUCKET_COUNT: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub enum BucketLayout {
    Linear {
        num_finite_buckets: u32,
        width: f64,
        offset: f64,
    },
    Exponential {
        num_finite_buckets: u32,
        growth_factor: f64,
        scale: f64,
    },
    Explicit {
        bounds: Vec<f64>,
    },
}

/// A layout compiled into its boundary list
#[derive(Debug, Clone, PartialEq)]
pub struct BucketResolver {
    layout: BucketLayout,
    boundaries: Vec<f64>,
}

impl BucketResolver {
    /// The layout must already be validated by the compiler.
    pub fn new(layout: BucketLayout) -> Self {
        let boundaries = boundaries(&layout);
        Self { layout, boundaries }
    }

    pub fn layout(&self) -> &BucketLayout {
        &self.layout
    }

    /// Ordered finite boundaries, `N - 1` of them
    pub fn boundaries(&self) -> &[f64] {
        &self.boundaries
    }

    /// Total bucket count including underflow and overflow
    pub fn bucket_count(&self) -> usize {
        self.boundaries.len() + 1
    }

    /// Index of the bucket containing `value`
    pub fn index(&self, value: f64) -> usize {
        self.boundaries.partition_point(|bound| *bound <= value)
    }

    /// Half-open range `[lower, upper)` of bucket `index`, `None` past the overflow bucket
    pub fn range(&self, index: usize) -> Option<(f64, f64)> {
        if index >= self.bucket_count() {
            return None;
        }
        let lower = match index.checked_sub(1) {
            Some(prev) => *self.boundaries.get(prev)?,
            None => f64::NEG_INFINITY,
        };
        let upper = self.boundaries.get(index).copied().unwrap_or(f64::INFINITY);
        Some((lower, upper))
    }

    /// Bucket options in the backend's wire shape
    pub fn options(&self) -> BucketOptions {
        match &self.layout {
            BucketLayout::Linear {
                num_finite_buckets,
                width,
                offset,
            } => BucketOptions::LinearBuckets {
                num_finite_buckets: *num_finite_buckets,
                width: *width,
                offset: *offset,
            },
            BucketLayout::Exponential {
                num_finite_buckets,
                growth_factor,
                scale,
            } => BucketOptions::ExponentialBuckets {
                num_finite_buckets: *num_finite_buckets,
                growth_factor: *growth_factor,
                scale: *scale,
            },
            BucketLayout::Explicit { bounds } => BucketOptions::ExplicitBuckets {
                bounds: bounds.clone(),
            },
        }
    }
}

fn boundaries(layout: &BucketLayout) -> Vec<f64> {
    match layout {
        BucketLayout::Linear {
            num_finite_buckets,
            width,
            offset,
        } => (0..=*num_finite_buckets)
            .map(|i| offset + width * f64::from(i))
            .collect(),
        BucketLayout::Exponential {
            num_finite_buckets,
            growth_factor,
            scale,
        } => (0..=*num_finite_buckets)
            .map(|i| scale * growth_factor.powi(i as i32))
            .collect(),
        BucketLayout::Explicit { bounds } => bounds.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BucketOptions {
    #[serde(rename_all = "camelCase")]
    LinearBuckets {
        num_finite_buckets: u32,
        width: f64,
        offset: f64,
    },
    #[serde(rename_all = "camelCase")]
    ExponentialBuckets {
        num_finite_buckets: u32,
        growth_factor: f64,
        scale: f64,
    },
    ExplicitBuckets { bounds: Vec<f64> },
}
