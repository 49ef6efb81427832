use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::compactor;
use crate::engine::{Engine, EngineConfig};
use crate::limits::*;
use crate::notify::NotifyHub;

/// One engine (timeline, catalog, WAL, compactor) per display tenant.
/// The tenant is the database name of the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    config: EngineConfig,
}

/// Keep only characters that are safe in a file name.
fn sanitize(tenant: &str) -> String {
    tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, config: EngineConfig) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Get or lazily create the engine for `tenant`, replaying its WAL.
    /// Names that sanitize to the same file name share one engine.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
        }
        let safe_name = sanitize(tenant);
        if safe_name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // Two connections racing on a new tenant must share one engine.
        let entry = self.engines.entry(safe_name.clone());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(
            wal_path,
            Arc::new(NotifyHub::new()),
            self.config,
        )?);
        tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));

        entry.or_insert(engine.clone());
        tracing::info!("tenant {safe_name:?} loaded");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("marquee_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, EngineConfig::default())
    }

    fn video(id: Ulid) -> Content {
        Content {
            id,
            title: "Promo".into(),
            kind: ContentKind::Video { url: "https://cdn/promo.mp4".into() },
            default_duration: Some(30),
            owner: SYSTEM_OWNER.into(),
        }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = manager(test_data_dir("isolation"));
        let lobby = tm.get_or_create("lobby").unwrap();
        let cafe = tm.get_or_create("cafe").unwrap();

        let cid = Ulid::new();
        lobby.register_content(video(cid)).await.unwrap();
        cafe.register_content(video(cid)).await.unwrap();

        lobby.create_schedule(cid, 0, None, None).await.unwrap();
        // Same slot on another display is not a conflict.
        let p = cafe.create_schedule(cid, 0, None, None).await.unwrap();
        assert!(!p.adjusted);
        assert_eq!(lobby.list_schedules().await.len(), 1);
        assert_eq!(cafe.list_schedules().await.len(), 1);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());
        assert!(tm.is_empty());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let _eng = tm.get_or_create("my_display").unwrap();
        assert!(dir.join("my_display.wal").exists());
        assert_eq!(tm.len(), 1);
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let tm = manager(test_data_dir("same_eng"));
        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn names_sharing_a_wal_share_one_engine() {
        let dir = test_data_dir("collide");
        let cid = Ulid::new();
        {
            let tm = manager(dir.clone());
            let dotted = tm.get_or_create("lobby.east").unwrap();
            let plain = tm.get_or_create("lobbyeast").unwrap();
            assert!(Arc::ptr_eq(&dotted, &plain));
            assert_eq!(tm.len(), 1);

            dotted.register_content(video(cid)).await.unwrap();
            assert!(plain.register_content(video(cid)).await.is_err());
        }
        let tm = manager(dir);
        let eng = tm.get_or_create("lobbyeast").unwrap();
        assert_eq!(eng.list_contents().len(), 1);
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));
        let err = tm
            .get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let tm = manager(test_data_dir("count_limit"));
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }

    #[tokio::test]
    async fn tenant_state_survives_reload() {
        let dir = test_data_dir("reload");
        let cid = Ulid::new();
        {
            let tm = manager(dir.clone());
            let eng = tm.get_or_create("hall").unwrap();
            eng.register_content(video(cid)).await.unwrap();
            eng.create_schedule(cid, 60_000, None, None).await.unwrap();
        }
        let tm = manager(dir);
        let eng = tm.get_or_create("hall").unwrap();
        assert!(eng.get_content(cid).is_some());
        let entries = eng.list_schedules().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].span, Span::new(60_000, 90_000));
    }
}
