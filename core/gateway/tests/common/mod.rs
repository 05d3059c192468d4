#![allow(dead_code)]

use std::sync::Arc;

use keyledger_audit::{AuditConfig, AuditRecorder, MemorySink, TracingAlertHandler};
use keyledger_common::{AuditEventKind, UserId};
use keyledger_crypto::MasterKey;
use keyledger_gateway::E2eeService;
use keyledger_keys::KeyConfig;
use keyledger_ledger::LedgerConfig;
use keyledger_store::{KeyStore, MemoryRepository};

pub struct Harness {
    pub service: Arc<E2eeService>,
    pub sink: Arc<MemorySink>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(KeyConfig::default(), LedgerConfig::default()).await
    }

    pub async fn with_config(keys: KeyConfig, ledger: LedgerConfig) -> Self {
        let repo = Arc::new(MemoryRepository::new());
        let store = KeyStore::open(repo.clone(), MasterKey::generate())
            .await
            .unwrap();
        let sink = Arc::new(MemorySink::new());
        let recorder = AuditRecorder::new(
            &AuditConfig::default(),
            sink.clone(),
            Arc::new(TracingAlertHandler),
        )
        .unwrap();
        let service =
            E2eeService::assemble(Arc::new(store), repo, keys, ledger, Arc::new(recorder))
                .unwrap();

        Self {
            service: Arc::new(service),
            sink,
        }
    }

    /// Audit events of one kind, after draining the recorder queue.
    pub async fn events(&self, kind: AuditEventKind) -> usize {
        self.service.recorder().flush().await.unwrap();
        self.sink.events().iter().filter(|e| e.kind == kind).count()
    }
}

pub fn user(name: &str) -> UserId {
    UserId::new(name).unwrap()
}
