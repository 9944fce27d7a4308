use dbs_api_types::Fingerprint;

/// Decides which fingerprints enter the persistent index.
///
/// Keeping only a sampled fraction trades deduplication ratio for index
/// size; unsampled chunks are simply stored again on their next write.
pub trait SamplingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn should_index(&self, fingerprint: &Fingerprint) -> bool;
}

/// Index every fingerprint (the default).
pub struct FullSamplingStrategy;

impl SamplingStrategy for FullSamplingStrategy {
    fn name(&self) -> &'static str {
        "full"
    }

    fn should_index(&self, _fingerprint: &Fingerprint) -> bool {
        true
    }
}

/// Index fingerprints whose prefix falls into every n-th bucket.
pub struct SuffixSamplingStrategy {
    modulus: u64,
}

impl SuffixSamplingStrategy {
    pub fn new(modulus: u64) -> Self {
        Self {
            modulus: modulus.max(1),
        }
    }
}

impl SamplingStrategy for SuffixSamplingStrategy {
    fn name(&self) -> &'static str {
        "suffix"
    }

    fn should_index(&self, fingerprint: &Fingerprint) -> bool {
        fingerprint.prefix() % self.modulus == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn full_takes_everything() {
        let strategy = FullSamplingStrategy;
        assert!(strategy.should_index(&Fingerprint::new(&[1; 20]).unwrap()));
    }

    #[test]
    fn suffix_samples_a_fraction() {
        let strategy = SuffixSamplingStrategy::new(4);
        let sampled = (0u8..100)
            .filter(|b| strategy.should_index(&Fingerprint::new(&[*b; 20]).unwrap()))
            .count();
        assert!(sampled < 100);
    }
}
