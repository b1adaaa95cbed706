// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Scheduler: worker selection and per-worker rate derivation.
//!
//! Selection takes the first min(n, available) workers in registration
//! order. Rate derivation is pure integer arithmetic; for every policy
//! except `same` the derived sub-rates sum exactly to the requested total
//! rate, and for `same` every worker receives the full rate.

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::{RateDistribution, WorkerId, WorkerRecord};

/// One worker's share of a scheduled test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Selected worker
    pub worker_id: WorkerId,
    /// Dispatch address
    pub address: String,
    /// Derived requests/second for this worker
    pub rate_per_second: u64,
}

/// Scheduling policy knobs
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerPolicy {
    /// Reject instead of proceeding when fewer workers are available than
    /// requested
    pub reject_when_short: bool,
}

/// Build the assignment plan for a test against a fleet snapshot.
///
/// `available` must already be in the registry's stable selection order.
pub fn plan(
    available: &[WorkerRecord],
    worker_count: u32,
    rate_per_second: u64,
    distribution: RateDistribution,
    weights: Option<&[f64]>,
    policy: SchedulerPolicy,
) -> OrchestratorResult<Vec<Assignment>> {
    if available.is_empty() {
        return Err(OrchestratorError::FailedPrecondition(
            "no workers available".to_string(),
        ));
    }
    if policy.reject_when_short && (available.len() as u32) < worker_count {
        return Err(OrchestratorError::FailedPrecondition(format!(
            "requested {} workers, only {} available",
            worker_count,
            available.len()
        )));
    }

    let selected = &available[..available.len().min(worker_count as usize)];
    let rates = derive_rates(distribution, rate_per_second, selected.len(), weights)?;

    Ok(selected
        .iter()
        .zip(rates)
        .map(|(worker, rate)| Assignment {
            worker_id: worker.worker_id.clone(),
            address: worker.address.clone(),
            rate_per_second: rate,
        })
        .collect())
}

/// Derive per-worker sub-rates for `k` selected workers.
pub fn derive_rates(
    distribution: RateDistribution,
    rate: u64,
    k: usize,
    weights: Option<&[f64]>,
) -> OrchestratorResult<Vec<u64>> {
    if k == 0 {
        return Err(OrchestratorError::FailedPrecondition(
            "no workers selected".to_string(),
        ));
    }

    let rates = match distribution {
        RateDistribution::Shared => shared(rate, k),
        RateDistribution::Same => vec![rate; k],
        RateDistribution::Weighted => weighted(rate, k, weights)?,
        RateDistribution::Ramped => ramped(rate, k),
        RateDistribution::Burst => {
            let mut rates = ramped(rate, k);
            rates.reverse();
            rates
        }
    };

    debug_assert_eq!(rates.len(), k);
    Ok(rates)
}

/// Even split: remainder goes to the first workers in selection order
fn shared(rate: u64, k: usize) -> Vec<u64> {
    let base = rate / k as u64;
    let remainder = (rate % k as u64) as usize;
    (0..k)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

/// Proportional split: rounding residue lands on the heaviest worker so the
/// total is conserved. A missing, mismatched-by-zero, or zero-sum weights
/// vector falls back to the even split; a wrong-length vector is the
/// caller's error.
fn weighted(rate: u64, k: usize, weights: Option<&[f64]>) -> OrchestratorResult<Vec<u64>> {
    let weights = match weights {
        Some(w) if !w.is_empty() => w,
        _ => return Ok(shared(rate, k)),
    };
    if weights.len() != k {
        return Err(OrchestratorError::InvalidArgument(format!(
            "weights vector has {} entries for {} workers",
            weights.len(),
            k
        )));
    }
    if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
        return Err(OrchestratorError::InvalidArgument(
            "weights must be finite and non-negative".to_string(),
        ));
    }

    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Ok(shared(rate, k));
    }

    let mut rates: Vec<u64> = weights
        .iter()
        .map(|w| ((rate as f64) * w / total).round() as u64)
        .collect();

    // Pin the residue on the largest weight (first of the largest on ties)
    let assigned: u64 = rates.iter().sum();
    let mut heaviest = 0;
    for (i, w) in weights.iter().enumerate() {
        if *w > weights[heaviest] {
            heaviest = i;
        }
    }

    if assigned > rate {
        let excess = assigned - rate;
        rates[heaviest] = rates[heaviest].saturating_sub(excess);
    } else {
        rates[heaviest] += rate - assigned;
    }

    Ok(rates)
}

/// Triangular ramp: worker i of k gets floor(2*R*i / (k*(k+1))), residue on
/// the last worker. Produces a monotonically non-decreasing sequence.
fn ramped(rate: u64, k: usize) -> Vec<u64> {
    let k64 = k as u64;
    let denom = k64 * (k64 + 1);
    let mut rates: Vec<u64> = (1..=k64).map(|i| 2 * rate * i / denom).collect();
    let assigned: u64 = rates.iter().sum();
    rates[k - 1] += rate - assigned;
    rates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkerRecord;

    fn worker(id: &str) -> WorkerRecord {
        WorkerRecord::new(id, format!("{id}.internal:7071"))
    }

    fn sum(rates: &[u64]) -> u64 {
        rates.iter().sum()
    }

    #[test]
    fn test_shared_split_examples() {
        assert_eq!(
            derive_rates(RateDistribution::Shared, 100, 3, None).unwrap(),
            vec![34, 33, 33]
        );
        assert_eq!(
            derive_rates(RateDistribution::Shared, 50, 4, None).unwrap(),
            vec![13, 13, 12, 12]
        );
        assert_eq!(
            derive_rates(RateDistribution::Shared, 1, 3, None).unwrap(),
            vec![1, 0, 0]
        );
        assert_eq!(
            derive_rates(RateDistribution::Shared, 0, 1, None).unwrap(),
            vec![0]
        );
    }

    #[test]
    fn test_same_gives_full_rate_to_each() {
        assert_eq!(
            derive_rates(RateDistribution::Same, 200, 3, None).unwrap(),
            vec![200, 200, 200]
        );
    }

    #[test]
    fn test_weighted_split() {
        assert_eq!(
            derive_rates(RateDistribution::Weighted, 100, 3, Some(&[2.0, 1.0, 1.0])).unwrap(),
            vec![50, 25, 25]
        );
        // Residue lands on the heaviest worker
        let rates =
            derive_rates(RateDistribution::Weighted, 100, 3, Some(&[5.0, 3.0, 1.0])).unwrap();
        assert_eq!(sum(&rates), 100);
        assert_eq!(rates[0], 100 - rates[1] - rates[2]);
    }

    #[test]
    fn test_weighted_falls_back_to_shared() {
        // No weights
        assert_eq!(
            derive_rates(RateDistribution::Weighted, 100, 3, None).unwrap(),
            vec![34, 33, 33]
        );
        // Zero-sum weights
        assert_eq!(
            derive_rates(RateDistribution::Weighted, 100, 3, Some(&[0.0, 0.0, 0.0])).unwrap(),
            vec![34, 33, 33]
        );
    }

    #[test]
    fn test_weighted_rejects_bad_vectors() {
        let err =
            derive_rates(RateDistribution::Weighted, 100, 3, Some(&[1.0, 2.0])).unwrap_err();
        assert!(err.is_invalid_argument());

        let err = derive_rates(RateDistribution::Weighted, 100, 2, Some(&[1.0, -1.0]))
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_ramped_is_monotonic_and_conserving() {
        let rates = derive_rates(RateDistribution::Ramped, 100, 4, None).unwrap();
        assert_eq!(sum(&rates), 100);
        for pair in rates.windows(2) {
            assert!(pair[0] <= pair[1], "ramp must not decrease: {rates:?}");
        }
    }

    #[test]
    fn test_burst_mirrors_ramped() {
        let ramped = derive_rates(RateDistribution::Ramped, 100, 4, None).unwrap();
        let burst = derive_rates(RateDistribution::Burst, 100, 4, None).unwrap();
        let mut mirrored = ramped.clone();
        mirrored.reverse();
        assert_eq!(burst, mirrored);
        assert_eq!(sum(&burst), 100);
    }

    #[test]
    fn test_conservation_across_policies() {
        for rate in [0u64, 1, 7, 100, 999, 12345] {
            for k in 1..=9usize {
                for dist in [
                    RateDistribution::Shared,
                    RateDistribution::Ramped,
                    RateDistribution::Burst,
                ] {
                    let rates = derive_rates(dist, rate, k, None).unwrap();
                    assert_eq!(sum(&rates), rate, "{dist} rate={rate} k={k}");
                }
                let weights: Vec<f64> = (1..=k).map(|i| i as f64).collect();
                let rates =
                    derive_rates(RateDistribution::Weighted, rate, k, Some(&weights)).unwrap();
                assert_eq!(sum(&rates), rate, "weighted rate={rate} k={k}");

                let rates = derive_rates(RateDistribution::Same, rate, k, None).unwrap();
                assert_eq!(sum(&rates), rate * k as u64, "same rate={rate} k={k}");
            }
        }
    }

    #[test]
    fn test_rate_below_worker_count() {
        // Some workers get zero; same still gives everyone the full rate
        let rates = derive_rates(RateDistribution::Shared, 2, 4, None).unwrap();
        assert_eq!(rates, vec![1, 1, 0, 0]);
        let rates = derive_rates(RateDistribution::Same, 2, 4, None).unwrap();
        assert_eq!(rates, vec![2, 2, 2, 2]);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = derive_rates(RateDistribution::Shared, 100, 0, None).unwrap_err();
        assert!(matches!(err, OrchestratorError::FailedPrecondition(_)));
    }

    #[test]
    fn test_plan_selects_in_order() {
        let available = vec![worker("w-1"), worker("w-2"), worker("w-3")];
        let plan = plan(
            &available,
            2,
            100,
            RateDistribution::Shared,
            None,
            SchedulerPolicy::default(),
        )
        .unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].worker_id, "w-1");
        assert_eq!(plan[0].rate_per_second, 50);
        assert_eq!(plan[1].worker_id, "w-2");
        assert_eq!(plan[1].rate_per_second, 50);
    }

    #[test]
    fn test_plan_proceeds_with_reduced_fleet() {
        let available = vec![worker("w-1")];
        let plan = plan(
            &available,
            3,
            99,
            RateDistribution::Shared,
            None,
            SchedulerPolicy::default(),
        )
        .unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].rate_per_second, 99);
    }

    #[test]
    fn test_plan_reject_when_short() {
        let available = vec![worker("w-1")];
        let err = plan(
            &available,
            3,
            99,
            RateDistribution::Shared,
            None,
            SchedulerPolicy {
                reject_when_short: true,
            },
        )
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::FailedPrecondition(_)));
    }

    #[test]
    fn test_plan_empty_fleet_rejected() {
        let err = plan(
            &[],
            1,
            10,
            RateDistribution::Shared,
            None,
            SchedulerPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::FailedPrecondition(_)));
    }
}
