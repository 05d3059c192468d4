//! KeyLedger engine surface.
//!
//! [`E2eeService`] wires the key lifecycle manager, the transaction ledger,
//! the encryption engine and the audit recorder together and exposes the
//! operations callers use. [`RequestEncryptionGateway`] applies them to HTTP
//! requests according to a per-endpoint [`PolicyTable`].

pub mod config;
pub mod gateway;
pub mod maintenance;
pub mod policy;
pub mod service;
pub mod wire;

pub use config::{
    EngineConfig, MasterKeySource, MasterSecret, Repositories, StoreConfig, DEFAULT_MASTER_KEY_VAR,
};
pub use gateway::{error_response, status_for, RequestEncryptionGateway, RequestIdentity};
pub use maintenance::{
    run_maintenance, spawn_maintenance, Maintenance, MaintenanceHandle, MaintenanceReport,
    MaintenanceRequest,
};
pub use policy::{EndpointPolicy, PolicyRule, PolicyTable};
pub use service::{E2eeService, EngineStats, DECRYPTION_FAILED_REASON};
