//! Favorite songs and singers, kept outside the engine.
//!
//! The karaoke front end marks favorites; the engine only needs somewhere to put them.
//! [`MemoryFavorites`] is for tests and one-off runs, [`SettingsFavorites`] keeps them
//! in the settings file next to the rest of the configuration.
use std::collections::HashMap;

use log::debug;

use crate::common::{box_error::BoxError, config::Config};

pub trait FavoritesStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>, BoxError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), BoxError>;
}

#[derive(Debug, Default)]
pub struct MemoryFavorites {
    values: HashMap<String, String>,
}

impl MemoryFavorites {
    pub fn new() -> MemoryFavorites {
        MemoryFavorites::default()
    }
}

impl FavoritesStore for MemoryFavorites {
    fn get(&self, key: &str) -> Result<Option<String>, BoxError> {
        Ok(self.values.get(key).cloned())
    }
    fn set(&mut self, key: &str, value: &str) -> Result<(), BoxError> {
        self.values.insert(String::from(key), String::from(value));
        Ok(())
    }
}

const KEY_PREFIX: &str = "favorite_";

pub struct SettingsFavorites {
    config: Config,
}

impl SettingsFavorites {
    pub fn build(config: Config) -> SettingsFavorites {
        SettingsFavorites { config }
    }
}

impl FavoritesStore for SettingsFavorites {
    fn get(&self, key: &str) -> Result<Option<String>, BoxError> {
        Ok(self
            .config
            .get_str_value(&format!("{}{}", KEY_PREFIX, key), None)
            .ok())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), BoxError> {
        let key = format!("{}{}", KEY_PREFIX, key);
        self.config.set_value(&key, value)?;
        self.config.save_settings()?;
        debug!("saved {}", key);
        Ok(())
    }
}
