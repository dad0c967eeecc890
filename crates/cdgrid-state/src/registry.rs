//! App registry: the set of applications allowed to request deployment.
//!
//! The set is only ever replaced as a whole.

use std::collections::HashSet;

use constant_time_eq::constant_time_eq;
use redb::{ReadableDatabase, ReadableTable};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, encode, read_all, read_record};
use crate::tables::APPS;
use crate::types::AppRegistration;

impl StateStore {
    /// Atomically discard every registration and install `apps`.
    ///
    /// A set with an empty or duplicate id, or an empty target, is rejected
    /// and the current set is kept.
    pub fn replace_apps(&self, apps: &[AppRegistration]) -> StateResult<()> {
        validate(apps)?;

        let txn = self.begin_write()?;
        {
            let mut table = txn.open_table(APPS).map_err(map_err!(Table))?;
            let existing: Vec<String> = {
                let mut keys = Vec::new();
                for entry in table.iter().map_err(map_err!(Read))? {
                    let (key, _) = entry.map_err(map_err!(Read))?;
                    keys.push(key.value().to_string());
                }
                keys
            };
            for key in &existing {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            for app in apps {
                let value = encode(app)?;
                table
                    .insert(app.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(count = apps.len(), "app registry replaced");
        Ok(())
    }

    /// List all registrations.
    pub fn list_apps(&self) -> StateResult<Vec<AppRegistration>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPS).map_err(map_err!(Table))?;
        read_all(&table)
    }

    /// Resolve an app's target from its id and secret.
    ///
    /// Unknown ids and wrong secrets both yield [`StateError::AuthFailed`].
    pub fn authenticate(&self, id: &str, secret: &str) -> StateResult<String> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPS).map_err(map_err!(Table))?;
        let app: Option<AppRegistration> = read_record(&table, id)?;
        match app {
            Some(app) if secrets_match(&app.secret, secret) => Ok(app.target),
            _ => {
                debug!(app_id = %id, "authentication failed");
                Err(StateError::AuthFailed)
            }
        }
    }
}

fn validate(apps: &[AppRegistration]) -> StateResult<()> {
    let mut seen = HashSet::new();
    for app in apps {
        if app.id.is_empty() {
            return Err(StateError::InvalidRegistration("empty app id".into()));
        }
        if app.target.is_empty() {
            return Err(StateError::InvalidRegistration(format!(
                "app {} has an empty target",
                app.id
            )));
        }
        if !seen.insert(app.id.as_str()) {
            return Err(StateError::InvalidRegistration(format!(
                "duplicate app id {}",
                app.id
            )));
        }
    }
    Ok(())
}

/// Constant-time comparison of a stored and a presented secret.
fn secrets_match(expected: &str, given: &str) -> bool {
    constant_time_eq(expected.as_bytes(), given.as_bytes())
}
