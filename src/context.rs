//! Per-run identity and credentials.
//!
//! Every run owns a fresh set of Docker object names and database
//! credentials, all derived from a random run id so that concurrent runs on
//! the same host never collide. The database password is minted here, lives
//! only in memory and in the state snapshot, and is redacted from Debug
//! output so it cannot leak through logging.

use crate::error::{self, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::fmt;

const NAME_PREFIX: &str = "upgrader";

/// Bytes of entropy behind the run id (rendered as 10 hex chars).
const RUN_ID_BYTES: usize = 5;
/// Bytes of entropy behind the database password (rendered as 32 hex chars).
const PASSWORD_BYTES: usize = 16;

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct RunContext {
    pub(crate) run_id: String,
    pub(crate) db_container_name: String,
    pub(crate) upgrade_container_name: String,
    pub(crate) network_name: String,
    pub(crate) volume_name: String,
    pub(crate) db_user: String,
    pub(crate) db_password: String,
    pub(crate) bootstrap_db_name: String,
    pub(crate) target_db_name: String,
}

impl RunContext {
    /// Mints a new context from the platform's secure random number
    /// generator. RNG failure is a fatal startup error.
    pub(crate) fn generate() -> Result<Self> {
        let run_id = random_hex(RUN_ID_BYTES)?;
        let password = random_hex(PASSWORD_BYTES)?;
        let prefix = format!("{}_{}", NAME_PREFIX, run_id);

        Ok(Self {
            db_container_name: format!("{}_db", prefix),
            upgrade_container_name: format!("{}_upgrade", prefix),
            network_name: format!("{}_net", prefix),
            volume_name: format!("{}_pgdata", prefix),
            db_user: format!("odoo_{}", &run_id[..8]),
            db_password: password,
            bootstrap_db_name: "odoo".to_string(),
            target_db_name: "database".to_string(),
            run_id,
        })
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("db_container_name", &self.db_container_name)
            .field("upgrade_container_name", &self.upgrade_container_name)
            .field("network_name", &self.network_name)
            .field("volume_name", &self.volume_name)
            .field("db_user", &self.db_user)
            .field("db_password", &"<redacted>")
            .field("bootstrap_db_name", &self.bootstrap_db_name)
            .field("target_db_name", &self.target_db_name)
            .finish()
    }
}

fn random_hex(bytes: usize) -> Result<String> {
    let mut buf = vec![0u8; bytes];
    rand::rngs::OsRng
        .try_fill_bytes(&mut buf)
        .context(error::SecureRandomSnafu)?;
    Ok(hex::encode(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_are_run_scoped() {
        let ctx = RunContext::generate().unwrap();
        assert_eq!(ctx.run_id.len(), 10);
        assert!(ctx.run_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(
            ctx.db_container_name,
            format!("upgrader_{}_db", ctx.run_id)
        );
        assert_eq!(
            ctx.upgrade_container_name,
            format!("upgrader_{}_upgrade", ctx.run_id)
        );
        assert_eq!(ctx.network_name, format!("upgrader_{}_net", ctx.run_id));
        assert_eq!(ctx.volume_name, format!("upgrader_{}_pgdata", ctx.run_id));
        assert_eq!(ctx.db_user, format!("odoo_{}", &ctx.run_id[..8]));
    }

    #[test]
    fn contexts_are_unique() {
        let a = RunContext::generate().unwrap();
        let b = RunContext::generate().unwrap();
        assert_ne!(a.run_id, b.run_id);
        assert_ne!(a.db_container_name, b.db_container_name);
        assert_ne!(a.network_name, b.network_name);
        assert_ne!(a.volume_name, b.volume_name);
        assert_ne!(a.db_user, b.db_user);
        assert_ne!(a.db_password, b.db_password);
    }

    #[test]
    fn password_shape() {
        let ctx = RunContext::generate().unwrap();
        assert_eq!(ctx.db_password.len(), 32);
        assert!(ctx.db_password.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn debug_redacts_password() {
        let ctx = RunContext::generate().unwrap();
        let rendered = format!("{:?}", ctx);
        assert!(!rendered.contains(&ctx.db_password));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn context_round_trips_through_json() {
        let ctx = RunContext::generate().unwrap();
        let json = serde_json::to_string(&ctx).unwrap();
        let back: RunContext = serde_json::from_str(&json).unwrap();
        assert_eq!(ctx, back);
    }
}
