#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use graph_core::{
    build_dispatcher_with_store, oauth::DeviceAuthStart, DevicePromptSink, Dispatcher,
    MemoryTokenStore, Settings, TokenStore,
};
use wiremock::MockServer;

pub const TENANT: &str = "72f988bf-86f1-41af-91ab-2d7cd011db47";
pub const CLIENT: &str = "0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9";

/// Mock identity provider and mock Graph, one server each.
pub struct Harness {
    pub idp: MockServer,
    pub graph: MockServer,
}

impl Harness {
    pub async fn start() -> Self {
        Self {
            idp: MockServer::start().await,
            graph: MockServer::start().await,
        }
    }

    pub fn token_path(&self) -> String {
        format!("/{}/oauth2/v2.0/token", TENANT)
    }

    pub fn devicecode_path(&self) -> String {
        format!("/{}/oauth2/v2.0/devicecode", TENANT)
    }

    pub fn settings(&self, extra: &[(&str, &str)]) -> Settings {
        let mut vars: HashMap<String, String> = HashMap::new();
        vars.insert("AZURE_CLIENT_ID".into(), CLIENT.into());
        vars.insert("AZURE_TENANT_ID".into(), TENANT.into());
        vars.insert("GRAPH_BASE_URL".into(), format!("{}/v1.0", self.graph.uri()));
        vars.insert("AZURE_AUTHORITY_HOST".into(), self.idp.uri());
        vars.insert("GRAPH_REQUEST_TIMEOUT".into(), "5".into());
        vars.insert("OPERATION_TIMEOUT".into(), "10".into());
        for (k, v) in extra {
            vars.insert(k.to_string(), v.to_string());
        }
        Settings::from_lookup(|k| vars.get(k).cloned()).expect("test settings")
    }

    pub fn dispatcher(&self, settings: &Settings) -> (Dispatcher, Arc<RecordingSink>) {
        self.dispatcher_with_store(settings, Arc::new(MemoryTokenStore::new()))
    }

    pub fn dispatcher_with_store(
        &self,
        settings: &Settings,
        store: Arc<dyn TokenStore>,
    ) -> (Dispatcher, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = build_dispatcher_with_store(settings, store, sink.clone())
            .expect("dispatcher")
            .with_retry_delay(Duration::from_millis(10));
        (dispatcher, sink)
    }
}

/// Remembers every device prompt it is shown.
#[derive(Default)]
pub struct RecordingSink {
    prompts: Mutex<Vec<DeviceAuthStart>>,
}

impl RecordingSink {
    pub fn count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn user_codes(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.user_code.clone())
            .collect()
    }
}

impl DevicePromptSink for RecordingSink {
    fn device_code_issued(&self, prompt: &DeviceAuthStart) {
        self.prompts.lock().unwrap().push(prompt.clone());
    }
}
