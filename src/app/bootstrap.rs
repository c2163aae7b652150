use crate::config::KvtilesConfig;
use crate::error::BootstrapError;
use crate::storage::{DirectoryStorage, MapInfos, MapStorage};
use crate::templates::{TemplateSet, TEMPLATE_NAMES};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// Everything the services need, loaded before any socket is opened
pub struct Bootstrapped {
    pub storage: Arc<dyn MapStorage>,
    pub infos: MapInfos,
    pub templates: TemplateSet,
}

/// Open the map database and load what the services serve from it.
///
/// Fails fast: the first error is returned and nothing is bound.
pub async fn bootstrap(config: &KvtilesConfig) -> Result<Bootstrapped, BootstrapError> {
    let db_path = &config.storage.db_path;

    let storage = DirectoryStorage::open_read_only(db_path)
        .await
        .map_err(|e| {
            error!("Failed to open database {}: {}", db_path.display(), e);
            BootstrapError::StorageOpen {
                path: db_path.clone(),
                source: e,
            }
        })?;

    prepare(Arc::new(storage), &config.storage.static_dir).await
}

/// Read map metadata from `storage` and parse the page templates
pub async fn prepare(
    storage: Arc<dyn MapStorage>,
    static_dir: &Path,
) -> Result<Bootstrapped, BootstrapError> {
    let infos = storage
        .load_map_infos()
        .await
        .map_err(BootstrapError::MapInfosUnreadable)?
        .ok_or(BootstrapError::NoMapInfos)?;

    info!(
        "Serving region {} indexed at {} (zoom {}-{})",
        infos.region,
        infos.index_time.to_rfc3339(),
        infos.min_zoom,
        infos.max_zoom
    );

    let templates = TemplateSet::parse_dir(static_dir, &TEMPLATE_NAMES).await?;
    info!(
        "Parsed {} templates from {}",
        TEMPLATE_NAMES.len(),
        static_dir.display()
    );

    Ok(Bootstrapped {
        storage,
        infos,
        templates,
    })
}
