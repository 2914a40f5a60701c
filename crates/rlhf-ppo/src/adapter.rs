//! Switching the active adapter and value head on the shared backbone.
//!
//! `activate` swaps adapter and value head together. The head being displaced
//! is cached in the model's `HeadBundle` under its own name, so switching back
//! restores it bit for bit, including any training it received while live.
//!
//! Prefer `with_active_head` / `with_head_restoring` (or a `HeadGuard`) over
//! bare `activate` calls: they put a head back on every exit path.

use crate::model::{DualHeadModel, HeadTarget};
use crate::{PpoError, Result};
use std::ops::{Deref, DerefMut};

/// Make `target` the live adapter and value head.
///
/// Fails with `PpoError::Config` when `target` has no cached head weights.
/// A failed activation leaves the model as it was.
pub fn activate<M: DualHeadModel + ?Sized>(model: &mut M, target: HeadTarget) -> Result<()> {
    let previous = model.active_adapter();

    if previous == target {
        // The live head already belongs to `target`; reloading the cache
        // would discard updates made since it was stored.
        return model.set_adapter(target);
    }

    let incoming = model.head_bundle().get(target).cloned().ok_or_else(|| {
        PpoError::Config(format!(
            "no cached `{}` value head; it must be established before switching to it",
            target
        ))
    })?;
    let displaced = model.value_head();

    model.set_adapter(target)?;
    if let Err(e) = model.load_value_head(&incoming) {
        model.set_adapter(previous)?;
        return Err(e);
    }
    model.head_bundle_mut().insert(previous, displaced);

    tracing::debug!(from = %previous, to = %target, "Switched value head");
    Ok(())
}

/// Scoped head activation: the previously active head comes back when the
/// guard is released or dropped, including during unwinding.
pub struct HeadGuard<'a, M: DualHeadModel + ?Sized> {
    model: &'a mut M,
    restore: HeadTarget,
    armed: bool,
}

impl<'a, M: DualHeadModel + ?Sized> HeadGuard<'a, M> {
    /// Activate `target`, remembering the head to restore.
    pub fn acquire(model: &'a mut M, target: HeadTarget) -> Result<Self> {
        let restore = model.active_adapter();
        Self::acquire_restoring(model, target, restore)
    }

    /// Activate `target`; `restore` becomes live again on release or drop,
    /// whatever head was live before.
    pub fn acquire_restoring(
        model: &'a mut M,
        target: HeadTarget,
        restore: HeadTarget,
    ) -> Result<Self> {
        if !model.head_bundle().contains(restore) && model.active_adapter() != restore {
            return Err(PpoError::Config(format!(
                "no cached `{}` value head to restore after `{}`",
                restore, target
            )));
        }
        activate(model, target)?;
        Ok(Self {
            model,
            restore,
            armed: true,
        })
    }

    /// Head that will be restored.
    pub fn restores_to(&self) -> HeadTarget {
        self.restore
    }

    /// Restore the previous head, surfacing any error.
    pub fn release(mut self) -> Result<()> {
        self.armed = false;
        activate(&mut *self.model, self.restore)
    }
}

impl<M: DualHeadModel + ?Sized> Deref for HeadGuard<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.model
    }
}

impl<M: DualHeadModel + ?Sized> DerefMut for HeadGuard<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        self.model
    }
}

impl<M: DualHeadModel + ?Sized> Drop for HeadGuard<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = activate(&mut *self.model, self.restore) {
                tracing::error!(target_head = %self.restore, "Failed to restore value head: {}", e);
            }
        }
    }
}

/// Run `scope` with `target` active, then restore the previous head whether
/// `scope` succeeds, fails or panics.
pub fn with_active_head<M, R, F>(model: &mut M, target: HeadTarget, scope: F) -> Result<R>
where
    M: DualHeadModel + ?Sized,
    F: FnOnce(&mut M) -> Result<R>,
{
    let restore = model.active_adapter();
    with_head_restoring(model, target, restore, scope)
}

/// Run `scope` with `target` active, then make `restore` live on every exit
/// path.
pub fn with_head_restoring<M, R, F>(
    model: &mut M,
    target: HeadTarget,
    restore: HeadTarget,
    scope: F,
) -> Result<R>
where
    M: DualHeadModel + ?Sized,
    F: FnOnce(&mut M) -> Result<R>,
{
    let mut guard = HeadGuard::acquire_restoring(model, target, restore)?;
    match scope(&mut *guard) {
        Ok(value) => {
            guard.release()?;
            Ok(value)
        }
        Err(e) => {
            drop(guard);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HeadWeights, TinyCausalLm};
    use ndarray::{array, Array1, Array2};
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn model() -> TinyCausalLm {
        TinyCausalLm::new(10, 4, 3)
    }

    #[test]
    fn test_activate_reward_loads_reward_head() {
        let mut m = model();
        let reward = m.head_bundle().get(HeadTarget::Reward).cloned().unwrap();

        activate(&mut m, HeadTarget::Reward).unwrap();

        assert_eq!(m.active_adapter(), HeadTarget::Reward);
        assert_eq!(m.value_head(), reward);
        assert!(m.head_bundle().contains(HeadTarget::Default));
    }

    #[test]
    fn test_round_trip_is_bit_identical() {
        let mut m = model();
        let before = m.value_head();

        activate(&mut m, HeadTarget::Reward).unwrap();
        activate(&mut m, HeadTarget::Default).unwrap();

        let after = m.value_head();
        assert_eq!(m.active_adapter(), HeadTarget::Default);
        for (a, b) in before.weight.iter().zip(after.weight.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
        assert_eq!(before.bias[0].to_bits(), after.bias[0].to_bits());
    }

    #[test]
    fn test_activate_default_is_idempotent() {
        let mut m = model();
        activate(&mut m, HeadTarget::Reward).unwrap();
        activate(&mut m, HeadTarget::Default).unwrap();
        let once = (m.value_head(), m.head_bundle().clone(), m.active_adapter());

        activate(&mut m, HeadTarget::Default).unwrap();
        let twice = (m.value_head(), m.head_bundle().clone(), m.active_adapter());

        assert_eq!(once, twice);
    }

    #[test]
    fn test_repeated_reward_keeps_default_cache() {
        let mut m = model();
        let default = m.value_head();

        activate(&mut m, HeadTarget::Reward).unwrap();
        activate(&mut m, HeadTarget::Reward).unwrap();

        assert_eq!(m.head_bundle().get(HeadTarget::Default), Some(&default));
    }

    #[test]
    fn test_trained_default_head_survives_reward_round_trip() {
        let mut m = model();
        let trained = HeadWeights::new(array![[0.1, 0.2, 0.3, 0.4]], array![1.5]);
        m.load_value_head(&trained).unwrap();

        activate(&mut m, HeadTarget::Reward).unwrap();
        activate(&mut m, HeadTarget::Default).unwrap();

        assert_eq!(m.value_head(), trained);
    }

    #[test]
    fn test_missing_cache_is_config_error_and_leaves_model_untouched() {
        let mut m = model();
        m.head_bundle_mut().remove(HeadTarget::Reward);
        let before = m.value_head();

        let err = activate(&mut m, HeadTarget::Reward).unwrap_err();

        assert!(matches!(err, PpoError::Config(_)));
        assert_eq!(m.active_adapter(), HeadTarget::Default);
        assert_eq!(m.value_head(), before);
        assert!(m.head_bundle().is_empty());
    }

    #[test]
    fn test_failed_head_load_rolls_back_adapter() {
        let mut m = model();
        let bad = HeadWeights::new(Array2::zeros((1, 7)), Array1::zeros(1));
        m.head_bundle_mut().insert(HeadTarget::Reward, bad);

        assert!(activate(&mut m, HeadTarget::Reward).is_err());
        assert_eq!(m.active_adapter(), HeadTarget::Default);
    }

    #[test]
    fn test_with_active_head_restores_on_success() {
        let mut m = model();
        let reward = m.head_bundle().get(HeadTarget::Reward).cloned().unwrap();

        let seen = with_active_head(&mut m, HeadTarget::Reward, |inner| {
            Ok((inner.active_adapter(), inner.value_head()))
        })
        .unwrap();

        assert_eq!(seen, (HeadTarget::Reward, reward));
        assert_eq!(m.active_adapter(), HeadTarget::Default);
    }

    #[test]
    fn test_with_active_head_restores_on_error() {
        let mut m = model();
        let before = m.value_head();

        let result: Result<()> = with_active_head(&mut m, HeadTarget::Reward, |_| {
            Err(PpoError::Validation("scoring failed".into()))
        });

        assert!(matches!(result, Err(PpoError::Validation(_))));
        assert_eq!(m.active_adapter(), HeadTarget::Default);
        assert_eq!(m.value_head(), before);
    }

    #[test]
    fn test_restoring_scope_ends_on_requested_head() {
        let mut m = model();
        let default = m.value_head();
        activate(&mut m, HeadTarget::Reward).unwrap();

        let seen = with_head_restoring(&mut m, HeadTarget::Reward, HeadTarget::Default, |inner| {
            Ok(inner.active_adapter())
        });

        assert_eq!(seen.unwrap(), HeadTarget::Reward);
        assert_eq!(m.active_adapter(), HeadTarget::Default);
        assert_eq!(m.value_head(), default);
    }

    #[test]
    fn test_restoring_scope_restores_on_error() {
        let mut m = model();
        activate(&mut m, HeadTarget::Reward).unwrap();

        let result: Result<()> =
            with_head_restoring(&mut m, HeadTarget::Reward, HeadTarget::Default, |_| {
                Err(PpoError::Validation("scoring failed".into()))
            });

        assert!(matches!(result, Err(PpoError::Validation(_))));
        assert_eq!(m.active_adapter(), HeadTarget::Default);
    }

    #[test]
    fn test_restoring_without_cached_target_fails_before_switching() {
        let mut m = model();
        // Fresh model: the default head is live and not yet cached.
        m.set_adapter(HeadTarget::Reward).unwrap();

        let result = HeadGuard::acquire_restoring(&mut m, HeadTarget::Reward, HeadTarget::Default);
        assert!(matches!(result, Err(PpoError::Config(_))));
        drop(result);
        assert_eq!(m.active_adapter(), HeadTarget::Reward);
    }

    #[test]
    fn test_guard_restores_on_panic() {
        let mut m = model();
        let before = m.value_head();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let guard = HeadGuard::acquire(&mut m, HeadTarget::Reward).unwrap();
            assert_eq!(guard.restores_to(), HeadTarget::Default);
            panic!("scoring blew up");
        }));

        assert!(outcome.is_err());
        assert_eq!(m.active_adapter(), HeadTarget::Default);
        assert_eq!(m.value_head(), before);
    }
}
