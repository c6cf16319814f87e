//! Buy-N-get-M bonus mints.

/// Grants `additional` free mints for every `threshold` paid mints a buyer
/// requests. A buy-5-get-2 promotion is `Bogo::new(5, 2)`.
#[derive(Debug, Clone, Copy)]
pub struct Bogo {
    pub threshold: u64,
    pub additional: u64,
}

impl Bogo {
    pub fn new(threshold: u64, additional: u64) -> Self {
        Self {
            threshold,
            additional,
        }
    }

    /// Bonus mints earned for a given requested (pre-cap) quantity. The
    /// requested count can be the unlimited sentinel, so the math saturates.
    pub fn determine_bonuses(&self, num_mints_requested: u64) -> u64 {
        (num_mints_requested / self.threshold).saturating_mul(self.additional)
    }
}
