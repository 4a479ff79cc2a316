//! Talos Linux configuration and bootstrapping.
//!
//! This module provides the Image Factory references, the shared machine
//! secrets, per-node machine config generation, talosconfig rendering and the
//! client used to apply configs and bootstrap the cluster.

mod client;
pub mod config;
pub mod image;
pub mod secrets;
mod talosconfig;

pub use client::{ApplyMode, TalosApi, TalosError, Talosctl, TALOS_API_PORT};
pub use config::{cluster_endpoint, generate, MachineConfig, K8S_API_PORT};
pub use image::{TalosImage, DEFAULT_SCHEMATIC_ID};
pub use secrets::{ClientConfiguration, MachineSecrets};
pub use talosconfig::render_talosconfig;
