//! KubeBridge library
//!
//! Connects a developer machine to a Kubernetes cluster through shadow pods:
//! route cluster networks locally (`connect`), take over a deployment's
//! traffic (`exchange`) or part of a service's traffic (`mesh`), and reverse
//! anything an interrupted session left behind (`clean`).

pub mod command;
pub mod config;
pub mod error;
pub mod k8s;
pub mod lock;
pub mod network;
pub mod registry;
pub mod tunnel;
