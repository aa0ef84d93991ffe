//! Werner-state entangled pairs.
//!
//! A pair is a Werner mixture characterized by a single parameter `w`, related
//! to fidelity by `F = (3w + 1) / 4`. The protocol stack treats the physics as
//! opaque: it only relies on `fidelity()`, `swap()`, `purify()`, and the
//! store/transfer error models defined here.
//!
//! - **Swapping** multiplies Werner parameters and succeeds with probability
//!   `ps`. The merged pair inherits the older creation clock, so its
//!   decoherence deadline is the minimum of the two inputs'.
//! - **Purification** keeps one pair and measures the other. Success
//!   probability and output fidelity follow the recurrence protocol on
//!   `F = min(F0, F1)`.
//! - **Decay** is exponential in the Werner parameter, driven by storage time
//!   or fiber length.

use std::collections::BTreeSet;

use crate::rng::SimRng;
use crate::time::Time;
use crate::{NodeId, PathId};

/// Identity of an elementary pair merged into a longer one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrigEpr {
    pub name: String,
    /// Elementary link index along the path, tagged at first swap.
    pub ch_index: Option<usize>,
}

/// An entangled pair in the Werner-state model.
#[derive(Debug, Clone)]
pub struct Entanglement {
    /// Unique name, used as the key in memories and signaling messages.
    pub name: String,
    w: f64,
    /// Set when the pair is lost (photon drop, decoherence deadline).
    pub is_decohered: bool,
    /// Left endpoint after all swaps so far.
    pub src: Option<NodeId>,
    /// Right endpoint after all swaps so far.
    pub dst: Option<NodeId>,
    /// When the earliest underlying physical pair was created.
    pub creation_time: Option<Time>,
    /// When the oldest underlying physical pair decoheres.
    pub decoherence_time: Option<Time>,
    /// Elementary link index along the path, for elementary pairs.
    pub ch_index: Option<usize>,
    /// Elementary pairs merged into this one; empty while elementary.
    pub orig_eprs: Vec<OrigEpr>,
    /// Path this pair was generated for, when pre-allocated.
    pub path_id: Option<PathId>,
    /// Candidate paths, used by statistical multiplexing.
    pub tmp_path_ids: Option<BTreeSet<PathId>>,
    /// Heralding attempts needed to produce this elementary pair.
    pub attempts: u64,
    /// Reservation key that produced this elementary pair.
    pub key: Option<String>,
}

impl Entanglement {
    /// New pair with the given fidelity.
    #[must_use]
    pub fn new(name: impl Into<String>, fidelity: f64) -> Self {
        Self {
            name: name.into(),
            w: (fidelity * 4.0 - 1.0) / 3.0,
            is_decohered: false,
            src: None,
            dst: None,
            creation_time: None,
            decoherence_time: None,
            ch_index: None,
            orig_eprs: Vec::new(),
            path_id: None,
            tmp_path_ids: None,
            attempts: 0,
            key: None,
        }
    }

    /// Fidelity with respect to the ideal Bell state.
    #[must_use]
    pub fn fidelity(&self) -> f64 {
        (self.w * 3.0 + 1.0) / 4.0
    }

    pub fn set_fidelity(&mut self, fidelity: f64) {
        self.w = (fidelity * 4.0 - 1.0) / 3.0;
    }

    /// Werner parameter.
    #[must_use]
    pub fn werner(&self) -> f64 {
        self.w
    }

    /// The elementary pairs underlying this one. A pair with no merge history
    /// is its own single record.
    #[must_use]
    pub fn elementary_records(&self) -> Vec<OrigEpr> {
        if self.orig_eprs.is_empty() {
            vec![OrigEpr {
                name: self.name.clone(),
                ch_index: self.ch_index,
            }]
        } else {
            self.orig_eprs.clone()
        }
    }

    /// Entanglement swapping with `other` at a shared node.
    ///
    /// Succeeds with probability `ps`, producing a merged pair named `name`
    /// whose Werner parameter is the product of the inputs', and whose
    /// creation and decoherence clocks are the older of the two. Endpoints are
    /// set by the caller. Returns `None` on failure or if either input has
    /// already decohered.
    pub fn swap(&self, other: &Entanglement, ps: f64, name: String, rng: &mut SimRng) -> Option<Entanglement> {
        if self.is_decohered || other.is_decohered {
            return None;
        }
        if ps < 1.0 && rng.random() > ps {
            return None;
        }

        let mut merged = Entanglement::new(name, 0.0);
        merged.w = self.w * other.w;
        merged.creation_time = match (self.creation_time, other.creation_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        merged.decoherence_time = match (self.decoherence_time, other.decoherence_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let mut origs = self.elementary_records();
        origs.extend(other.elementary_records());
        merged.orig_eprs = origs;
        Some(merged)
    }

    /// Success probability of one purification round at base fidelity `fmin`.
    #[must_use]
    pub fn purify_success_prob(fmin: f64) -> f64 {
        fmin * fmin + 2.0 * fmin * (1.0 - fmin) / 3.0 + 5.0 * ((1.0 - fmin) / 3.0).powi(2)
    }

    /// Output fidelity of a successful purification round at base fidelity `fmin`.
    #[must_use]
    pub fn purified_fidelity(fmin: f64) -> f64 {
        (fmin * fmin + ((1.0 - fmin) / 3.0).powi(2)) / Self::purify_success_prob(fmin)
    }

    /// Purify this pair using `other` as the measured pair.
    ///
    /// On success, this pair's fidelity increases; the measured pair is
    /// consumed by the caller either way. Fails outright when either pair has
    /// decohered or the base fidelity is at or below 1/2.
    pub fn purify(&mut self, other: &Entanglement, rng: &mut SimRng) -> bool {
        if self.is_decohered || other.is_decohered {
            return false;
        }
        let fmin = self.fidelity().min(other.fidelity());
        if fmin <= 0.5 {
            return false;
        }
        if rng.random() > Self::purify_success_prob(fmin) {
            return false;
        }
        self.set_fidelity(Self::purified_fidelity(fmin));
        true
    }

    /// Fidelity decay after storing in memory for `elapsed` seconds.
    pub fn store_error_model(&mut self, elapsed: f64, decoherence_rate: f64) {
        if decoherence_rate > 0.0 && elapsed > 0.0 {
            self.w *= (-decoherence_rate * elapsed).exp();
        }
    }

    /// Fidelity decay after traversing `length` kilometers of fiber.
    pub fn transfer_error_model(&mut self, length: f64, decoherence_rate: f64) {
        if decoherence_rate > 0.0 && length > 0.0 {
            self.w *= (-decoherence_rate * length).exp();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fidelity_roundtrip() {
        let pair = Entanglement::new("e", 0.9);
        assert!((pair.fidelity() - 0.9).abs() < 1e-12);
        let mut p2 = Entanglement::new("f", 1.0);
        assert!((p2.fidelity() - 1.0).abs() < 1e-12);
        p2.set_fidelity(0.75);
        assert!((p2.fidelity() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn swap_multiplies_werner_parameters() {
        let mut rng = SimRng::from_seed(0);
        let mut a = Entanglement::new("a", 0.9);
        let mut b = Entanglement::new("b", 0.9);
        a.creation_time = Some(Time::new(100, 1000));
        a.decoherence_time = Some(Time::new(600, 1000));
        b.creation_time = Some(Time::new(200, 1000));
        b.decoherence_time = Some(Time::new(700, 1000));

        let merged = a.swap(&b, 1.0, "m".into(), &mut rng).unwrap();
        assert!((merged.werner() - a.werner() * b.werner()).abs() < 1e-12);
        assert_eq!(merged.creation_time, Some(Time::new(100, 1000)));
        assert_eq!(merged.decoherence_time, Some(Time::new(600, 1000)));
        assert_eq!(merged.orig_eprs.len(), 2);
        // expected fidelity for two 0.9 pairs is about 0.813
        assert!((0.80..0.83).contains(&merged.fidelity()));
    }

    #[test]
    fn swap_fails_on_decohered_input() {
        let mut rng = SimRng::from_seed(0);
        let a = Entanglement::new("a", 0.9);
        let mut b = Entanglement::new("b", 0.9);
        b.is_decohered = true;
        assert!(a.swap(&b, 1.0, "m".into(), &mut rng).is_none());
    }

    #[test]
    fn swap_respects_success_probability() {
        let mut rng = SimRng::from_seed(42);
        let a = Entanglement::new("a", 0.9);
        let b = Entanglement::new("b", 0.9);
        let successes = (0..2000)
            .filter(|_| a.swap(&b, 0.5, "m".into(), &mut rng).is_some())
            .count();
        assert!((800..1200).contains(&successes));
    }

    #[test]
    fn purify_improves_fidelity() {
        let fmin = 0.9;
        let f_out = Entanglement::purified_fidelity(fmin);
        assert!(f_out > fmin);
        assert!(f_out <= 1.0);

        // at F = 1 purification always succeeds and keeps F = 1
        assert!((Entanglement::purify_success_prob(1.0) - 1.0).abs() < 1e-12);
        assert!((Entanglement::purified_fidelity(1.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn purify_rejects_low_fidelity() {
        let mut rng = SimRng::from_seed(0);
        let mut a = Entanglement::new("a", 0.5);
        let b = Entanglement::new("b", 0.5);
        assert!(!a.purify(&b, &mut rng));
    }

    #[test]
    fn store_error_decays_fidelity() {
        let mut pair = Entanglement::new("a", 0.9);
        let before = pair.fidelity();
        pair.store_error_model(0.1, 0.2);
        assert!(pair.fidelity() < before);
        assert!(pair.fidelity() > 0.5);
    }

    #[test]
    fn elementary_records_of_merged_pair() {
        let mut rng = SimRng::from_seed(0);
        let mut a = Entanglement::new("a", 0.9);
        a.ch_index = Some(0);
        let mut b = Entanglement::new("b", 0.9);
        b.ch_index = Some(1);
        let merged = a.swap(&b, 1.0, "m".into(), &mut rng).unwrap();
        let names: Vec<_> = merged.elementary_records().iter().map(|o| o.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
