//! Mirror of HomeMatic CCU system variables into `hmsysvars`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::db::{Db, HmSysVar};

/// Where system variables come from. `fetch` may block (network I/O) and is
/// run on the blocking pool.
pub trait SysVarSource: Send + Sync {
    fn fetch(&self, host: &str) -> Result<Vec<HmSysVar>>;
}

/// Used when no CCU transport is available.
pub struct DisabledSysVars;

impl SysVarSource for DisabledSysVars {
    fn fetch(&self, host: &str) -> Result<Vec<HmSysVar>> {
        debug!(host, "homematic transport disabled");
        Ok(Vec::new())
    }
}

/// Pull all system variables from the CCU named by `hmHost` and upsert them
/// by id. Nothing happens while `hmHost` is empty.
pub async fn sync_sys_vars(db: &Db, source: &Arc<dyn SysVarSource>) -> Result<usize> {
    let host = db.get_config_item("hmHost", "").await?;
    if host.trim().is_empty() {
        debug!("hmHost not set, skipping homematic sync");
        return Ok(0);
    }

    let src = Arc::clone(source);
    let fetch_host = host.clone();
    let vars = tokio::task::spawn_blocking(move || src.fetch(&fetch_host))
        .await
        .context("homematic fetch task failed")??;

    for v in &vars {
        db.upsert_hm_sys_var(v).await?;
    }
    info!(host = %host, count = vars.len(), "homematic system variables synced");
    Ok(vars.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<HmSysVar>);

    impl SysVarSource for Fixed {
        fn fetch(&self, _host: &str) -> Result<Vec<HmSysVar>> {
            Ok(self.0.clone())
        }
    }

    fn var(id: i64, value: &str) -> HmSysVar {
        HmSysVar {
            id,
            name: format!("var{id}"),
            kind: 4,
            unit: "°C".into(),
            visible: true,
            min: "-20".into(),
            max: "40".into(),
            time: 1_700_000_000,
            value: value.into(),
        }
    }

    #[tokio::test]
    async fn no_host_no_sync() {
        let db = Db::memory().await;
        let src: Arc<dyn SysVarSource> = Arc::new(Fixed(vec![var(1, "1")]));
        assert_eq!(sync_sys_vars(&db, &src).await.unwrap(), 0);
        assert!(db.hm_sys_vars().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_upserts_by_id() {
        let db = Db::memory().await;
        db.set_config_item("hmHost", "ccu.local").await.unwrap();

        let src: Arc<dyn SysVarSource> = Arc::new(Fixed(vec![var(1, "20.5"), var(2, "off")]));
        assert_eq!(sync_sys_vars(&db, &src).await.unwrap(), 2);

        let src: Arc<dyn SysVarSource> = Arc::new(Fixed(vec![var(1, "21.0")]));
        sync_sys_vars(&db, &src).await.unwrap();

        let stored = db.hm_sys_vars().await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].value, "21.0");
        assert_eq!(stored[1].value, "off");
    }
}
