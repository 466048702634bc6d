//! Activities registered with the runtime.

mod fetch_title;

pub use fetch_title::{extract_title, FetchTitleActivity, NO_TITLE};

use std::sync::Arc;

use crate::config::ActivityConfig;
use crate::orchestrations::FETCH_ACTIVITY;
use crate::runtime::registry::ActivityRegistry;

/// Registry holding the title-fetch activity.
pub fn activity_registry(config: ActivityConfig) -> ActivityRegistry {
    ActivityRegistry::builder()
        .register_handler(FETCH_ACTIVITY, Arc::new(FetchTitleActivity::new(config)))
        .build()
}
