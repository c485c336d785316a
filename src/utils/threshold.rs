//! Histogram-based automatic thresholding

/// Equal-width histogram over the finite values of a sample
#[derive(Debug, Clone)]
pub struct Histogram {
    pub min: f32,
    pub bin_width: f64,
    pub counts: Vec<usize>,
}

impl Histogram {
    /// Returns `None` for an empty sample, zero bins or a constant sample
    pub fn new(data: &[f32], num_bins: usize) -> Option<Self> {
        let (min, max) = data
            .iter()
            .filter(|v| v.is_finite())
            .fold(None, |acc: Option<(f32, f32)>, &v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })?;
        if num_bins == 0 || max - min <= f32::EPSILON * min.abs().max(1.0) {
            return None;
        }

        let bin_width = (max - min) as f64 / num_bins as f64;
        let mut counts = vec![0usize; num_bins];
        for v in data.iter().filter(|v| v.is_finite()) {
            let bin = ((*v - min) as f64 / bin_width) as usize;
            counts[bin.min(num_bins - 1)] += 1;
        }
        Some(Self { min, bin_width, counts })
    }

    /// Lower edge of `bin`
    pub fn edge(&self, bin: usize) -> f32 {
        (self.min as f64 + bin as f64 * self.bin_width) as f32
    }

    /// Bin index maximising the between-class variance
    pub fn otsu_bin(&self) -> usize {
        let total: usize = self.counts.iter().sum();
        let weighted_total: f64 = self
            .counts
            .iter()
            .enumerate()
            .map(|(i, &n)| i as f64 * n as f64)
            .sum();

        let mut below = 0usize;
        let mut weighted_below = 0.0;
        let mut best = (0usize, 0.0f64);
        for (bin, &n) in self.counts.iter().enumerate() {
            below += n;
            weighted_below += bin as f64 * n as f64;
            let above = total - below;
            if below == 0 {
                continue;
            }
            if above == 0 {
                break;
            }
            let mean_below = weighted_below / below as f64;
            let mean_above = (weighted_total - weighted_below) / above as f64;
            let spread = below as f64 * above as f64 * (mean_below - mean_above).powi(2);
            if spread > best.1 {
                best = (bin, spread);
            }
        }
        best.0
    }
}

/// Otsu's threshold of `data`
///
/// Returns the lower edge of the bin that best separates the two modes.
/// Non-finite values are ignored; an empty sample gives 0 and a constant
/// sample gives its value.
///
/// # Arguments
/// * `data` - Intensities, e.g. a flattened mean b0 image
/// * `num_bins` - Histogram resolution (typically 256)
pub fn otsu_threshold(data: &[f32], num_bins: usize) -> f32 {
    match Histogram::new(data, num_bins) {
        Some(histogram) => histogram.edge(histogram.otsu_bin()),
        None => data.iter().copied().find(|v| v.is_finite()).unwrap_or(0.0),
    }
}
