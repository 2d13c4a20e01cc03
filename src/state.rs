use std::sync::Arc;

use crate::config::ConfigStore;
use crate::download::DownloadManager;
use crate::manager::Manager;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub manager: Arc<Manager>,
    pub downloads: Arc<DownloadManager>,
}
