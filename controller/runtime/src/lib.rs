#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use xmesh_controller_core as core;
pub use xmesh_controller_k8s_api as k8s;
pub use xmesh_controller_k8s_inject as inject;
pub use xmesh_controller_xnet as xnet;

pub mod acl;
pub mod admission;
pub mod applier;
mod args;
pub mod broadcast;
pub mod certificate;
pub mod dns;
pub mod http;
pub mod index;
pub mod lease;
pub mod maps;
pub mod metrics;
pub mod probe;
pub mod scheduler;
pub mod status;
pub mod webhook;

pub use self::args::Args;
