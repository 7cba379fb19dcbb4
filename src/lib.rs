pub mod config;
pub mod controller;
pub mod evaluator;
pub mod image_reference;
pub mod inventory;
pub mod oci_registry;
pub mod registry_cache;
pub mod report;
pub mod secret;
pub mod state;
pub mod version;
pub mod webserver;
pub mod workload;
