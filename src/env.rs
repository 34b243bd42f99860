//! The process-wide environment: configuration plus the stores built from it.
use crate::config::Config;
use crate::store::CacheStore;
use crate::table::InputTables;

/// Built once at start-up and passed by reference to every stage.
#[derive(Debug, Clone)]
pub struct Environment {
    pub config: Config,
    pub store: CacheStore,
    pub inputs: InputTables,
}

impl Environment {
    pub fn new(config: Config) -> Self {
        let store = CacheStore::from_config(&config);
        let inputs = InputTables::new(&config.data_path);
        Self {
            config,
            store,
            inputs,
        }
    }
}
