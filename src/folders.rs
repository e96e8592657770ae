//! Creates the remote folders implied by a dragged-in folder tree.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use crate::api::{CreateFolderRequest, MaterialApi};
use crate::core::{FolderId, Result, UploadError};

/// Folder paths (`a`, `a/b`) containing the given file relative paths.
pub fn folder_paths_of<'a>(relative_paths: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut folders = BTreeSet::new();

    for path in relative_paths {
        if let Some((dir, _)) = path.rsplit_once('/') {
            let dir = dir.trim_matches('/');
            if !dir.is_empty() {
                folders.insert(dir.to_string());
            }
        }
    }

    folders.into_iter().collect()
}

fn depth(path: &str) -> usize {
    path.split('/').filter(|segment| !segment.is_empty()).count()
}

/// Deduplicated, shallowest first, ties in lexical order.
fn ordered_paths(paths: &[String]) -> Vec<String> {
    let unique: BTreeSet<String> = paths
        .iter()
        .map(|path| path.trim_matches('/').to_string())
        .filter(|path| !path.is_empty())
        .collect();

    let mut ordered: Vec<String> = unique.into_iter().collect();
    ordered.sort_by_key(|path| depth(path));
    ordered
}

pub struct FolderMaterializer {
    api: Arc<dyn MaterialApi>,
    is_public: bool,
}

impl FolderMaterializer {
    pub fn new(api: Arc<dyn MaterialApi>) -> Self {
        Self { api, is_public: false }
    }

    pub fn public(mut self, is_public: bool) -> Self {
        self.is_public = is_public;
        self
    }

    /// Create every missing folder under `parent_id` and map each requested
    /// relative path to its remote id. Intermediate folders (`x` for `x/y`)
    /// are created as needed but only requested paths are returned.
    ///
    /// The first failed creation aborts the whole run. Folders created before
    /// it are left in place remotely.
    #[instrument(skip(self, paths), fields(paths = paths.len()))]
    pub async fn materialize(&self, paths: &[String], parent_id: FolderId) -> Result<HashMap<String, FolderId>> {
        let requested = ordered_paths(paths);
        let mut folder_ids: HashMap<String, FolderId> = HashMap::new();

        for path in &requested {
            let mut current_path = String::new();
            let mut current_parent = parent_id;

            for segment in path.split('/').filter(|segment| !segment.is_empty()) {
                if !current_path.is_empty() {
                    current_path.push('/');
                }
                current_path.push_str(segment);

                if let Some(id) = folder_ids.get(&current_path) {
                    current_parent = *id;
                    continue;
                }

                let request = CreateFolderRequest {
                    name: segment.to_string(),
                    parent_id: current_parent,
                    is_public: self.is_public,
                    vector_index: format!("folder/{}", Uuid::new_v4()),
                };
                let id = self
                    .api
                    .create_folder(&request)
                    .await
                    .map_err(|err| UploadError::Folder {
                        path: current_path.clone(),
                        source: Box::new(err),
                    })?;

                info!(path = %current_path, id, parent_id = current_parent, "Folder created");
                folder_ids.insert(current_path.clone(), id);
                current_parent = id;
            }
        }

        Ok(requested
            .into_iter()
            .filter_map(|path| folder_ids.get(&path).map(|id| (path, *id)))
            .collect())
    }
}
