use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::messager::Engine;
use crate::schema::SchemaEngine;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub schema: Arc<SchemaEngine>,
    pub engine: Arc<Engine>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings, schema: Arc<SchemaEngine>, engine: Arc<Engine>) -> Self {
        Self {
            settings: Arc::new(settings),
            schema,
            engine,
            start_time: Instant::now(),
        }
    }
}
