use std::sync::Arc;
use tracing::info;

use crate::constants::MIN_USABLE_BALANCE;
use crate::error::{AppError, AppResult};
use crate::modules::persistence::credential_db::{Credential, CredentialStatus};
use crate::modules::persistence::store::Store;
use crate::proxy::credential::selector::KeySelector;
use crate::proxy::upstream::balance::BalanceProbe;

/// Applies the state-transition rules on credentials. All mutations go
/// through the registry; anything that can change what the selector sees
/// marks it dirty.
pub struct AvailabilityController {
    store: Store,
    selector: Arc<KeySelector>,
}

impl AvailabilityController {
    pub fn new(store: Store, selector: Arc<KeySelector>) -> Self {
        Self { store, selector }
    }

    /// A successful request wipes the error state. A credential that was
    /// sitting in error status comes back fully, availability included.
    pub fn on_success(&self, credential: &Credential) -> AppResult<()> {
        let was_error = credential.status == CredentialStatus::Error;
        self.store
            .set_credential_status(credential.id, CredentialStatus::Active, None)?;
        if was_error {
            self.store.set_credential_availability(credential.id, true)?;
            info!(
                "[Availability] Key {} recovered after successful call",
                credential.id
            );
        }
        self.selector.mark_dirty();
        Ok(())
    }

    /// A failed attempt bumps the error count and records the message.
    /// Status becomes `error` unless a balance probe already parked the
    /// credential in `insufficient`.
    pub fn on_failure(&self, id: i64, error_text: &str) -> AppResult<()> {
        self.store
            .set_credential_status(id, CredentialStatus::Error, Some(error_text))?;
        self.selector.mark_dirty();
        Ok(())
    }

    /// Applies a post-failure probe: a known balance below the threshold
    /// demotes the credential out of rotation. An unknown balance never
    /// demotes on its own.
    pub fn apply_balance_probe(&self, id: i64, probe: &BalanceProbe) -> AppResult<Option<f64>> {
        let Some(balance) = probe.balance else {
            return Ok(None);
        };
        self.store.set_credential_balance(id, balance)?;
        if balance < MIN_USABLE_BALANCE {
            self.store
                .set_credential_status(id, CredentialStatus::Insufficient, None)?;
            self.store.set_credential_availability(id, false)?;
            self.selector.mark_dirty();
            info!(
                "[Availability] Key {} demoted: balance {} below threshold",
                id, balance
            );
        }
        Ok(Some(balance))
    }

    /// Re-check rule used by the background balance job: unavailable iff the
    /// error count reached 3 and the known balance is exhausted.
    pub fn recheck(&self, id: i64) -> AppResult<()> {
        let Some(credential) = self.store.get_credential(id)? else {
            return Ok(());
        };
        let exhausted = credential.error_count >= 3
            && credential
                .balance
                .map(|b| b < MIN_USABLE_BALANCE)
                .unwrap_or(false);
        if credential.available == !exhausted {
            return Ok(());
        }
        self.store.set_credential_availability(id, !exhausted)?;
        self.selector.mark_dirty();
        Ok(())
    }

    /// Admin toggle. Re-enabling an errored credential resets it to a clean
    /// active state.
    pub fn manual_toggle(&self, id: i64) -> AppResult<Credential> {
        let credential = self
            .store
            .get_credential(id)?
            .ok_or_else(|| AppError::NotFound(format!("credential {id}")))?;

        if credential.available {
            self.store.set_credential_availability(id, false)?;
        } else {
            if credential.status == CredentialStatus::Error {
                self.store
                    .set_credential_status(id, CredentialStatus::Active, None)?;
            }
            self.store.set_credential_availability(id, true)?;
        }
        self.selector.mark_dirty();
        self.store
            .get_credential(id)?
            .ok_or_else(|| AppError::NotFound(format!("credential {id}")))
    }

    /// After a later credential succeeds, a previously failing one gets one
    /// probe: restored when funded again, left demoted otherwise.
    pub fn restore_if_funded(&self, id: i64, probe: &BalanceProbe) -> AppResult<bool> {
        let Some(balance) = probe.balance else {
            return Ok(false);
        };
        self.store.set_credential_balance(id, balance)?;
        if balance >= MIN_USABLE_BALANCE {
            self.store
                .set_credential_status(id, CredentialStatus::Active, None)?;
            self.store.set_credential_availability(id, true)?;
            self.selector.mark_dirty();
            info!("[Availability] Recovered previously failing key {}", id);
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Store, Arc<KeySelector>, AvailabilityController) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path()).expect("store");
        let selector = Arc::new(KeySelector::new(store.clone()).expect("selector"));
        let controller = AvailabilityController::new(store.clone(), selector.clone());
        (dir, store, selector, controller)
    }

    fn probe(balance: Option<f64>) -> BalanceProbe {
        BalanceProbe {
            ok: balance.is_some(),
            balance,
            message: String::new(),
        }
    }

    #[test]
    fn success_clears_error_state_and_restores_availability() {
        let (_dir, store, _selector, controller) = setup();
        let id = store.add_credential("sk-a").unwrap();
        store
            .set_credential_status(id, CredentialStatus::Error, Some("HTTP 500"))
            .unwrap();
        store.set_credential_availability(id, false).unwrap();

        let before = store.get_credential(id).unwrap().unwrap();
        controller.on_success(&before).unwrap();

        let after = store.get_credential(id).unwrap().unwrap();
        assert_eq!(after.status, CredentialStatus::Active);
        assert!(after.available);
        assert_eq!(after.error_count, 0);
        assert_eq!(after.last_error, None);
    }

    #[test]
    fn failure_accumulates_error_count() {
        let (_dir, store, _selector, controller) = setup();
        let id = store.add_credential("sk-b").unwrap();

        controller.on_failure(id, "HTTP 502").unwrap();
        controller.on_failure(id, "HTTP 503").unwrap();

        let cred = store.get_credential(id).unwrap().unwrap();
        assert_eq!(cred.status, CredentialStatus::Error);
        assert_eq!(cred.error_count, 2);
        assert_eq!(cred.last_error.as_deref(), Some("HTTP 503"));
        // A plain failure does not demote availability on its own.
        assert!(cred.available);
    }

    #[test]
    fn low_balance_probe_demotes_to_insufficient() {
        let (_dir, store, _selector, controller) = setup();
        let id = store.add_credential("sk-c").unwrap();

        let balance = controller
            .apply_balance_probe(id, &probe(Some(0.2)))
            .unwrap();
        assert_eq!(balance, Some(0.2));

        let cred = store.get_credential(id).unwrap().unwrap();
        assert_eq!(cred.status, CredentialStatus::Insufficient);
        assert!(!cred.available);
        assert_eq!(cred.balance, Some(0.2));
    }

    #[test]
    fn unknown_balance_never_demotes() {
        let (_dir, store, _selector, controller) = setup();
        let id = store.add_credential("sk-d").unwrap();

        let balance = controller.apply_balance_probe(id, &probe(None)).unwrap();
        assert_eq!(balance, None);

        let cred = store.get_credential(id).unwrap().unwrap();
        assert_eq!(cred.status, CredentialStatus::Active);
        assert!(cred.available);
        assert_eq!(cred.balance, None);
    }

    #[test]
    fn recheck_requires_both_conditions() {
        let (_dir, store, _selector, controller) = setup();
        let id = store.add_credential("sk-e").unwrap();
        for _ in 0..3 {
            controller.on_failure(id, "HTTP 500").unwrap();
        }

        // Errors alone are not enough while the balance is unknown.
        controller.recheck(id).unwrap();
        assert!(store.get_credential(id).unwrap().unwrap().available);

        store.set_credential_balance(id, 0.5).unwrap();
        controller.recheck(id).unwrap();
        assert!(!store.get_credential(id).unwrap().unwrap().available);

        // Refunding the account lifts the demotion.
        store.set_credential_balance(id, 25.0).unwrap();
        controller.recheck(id).unwrap();
        assert!(store.get_credential(id).unwrap().unwrap().available);
    }

    #[test]
    fn manual_toggle_resets_errored_credential() {
        let (_dir, store, _selector, controller) = setup();
        let id = store.add_credential("sk-f").unwrap();
        store
            .set_credential_status(id, CredentialStatus::Error, Some("HTTP 500"))
            .unwrap();
        store.set_credential_availability(id, false).unwrap();

        let toggled = controller.manual_toggle(id).unwrap();
        assert!(toggled.available);
        assert_eq!(toggled.status, CredentialStatus::Active);
        assert_eq!(toggled.error_count, 0);

        // Toggling off is a plain availability flip.
        let toggled = controller.manual_toggle(id).unwrap();
        assert!(!toggled.available);
        assert_eq!(toggled.status, CredentialStatus::Active);
    }

    #[test]
    fn restore_requires_replenished_balance() {
        let (_dir, store, _selector, controller) = setup();
        let id = store.add_credential("sk-g").unwrap();
        store
            .set_credential_status(id, CredentialStatus::Insufficient, None)
            .unwrap();
        store.set_credential_availability(id, false).unwrap();

        assert!(!controller.restore_if_funded(id, &probe(Some(0.4))).unwrap());
        assert!(!store.get_credential(id).unwrap().unwrap().available);

        assert!(controller.restore_if_funded(id, &probe(Some(5.0))).unwrap());
        let cred = store.get_credential(id).unwrap().unwrap();
        assert!(cred.available);
        assert_eq!(cred.status, CredentialStatus::Active);
    }
}
