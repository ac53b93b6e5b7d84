#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod labels;
pub mod machine;
pub mod xnetwork;

pub use self::{
    config::MeshConfig,
    machine::VirtualMachine,
    xnetwork::{AccessControl, EIPAdvertisement},
};
pub use k8s_openapi::{
    api::{
        self,
        admissionregistration::v1::MutatingWebhookConfiguration,
        core::v1::{
            Container, Namespace, Node, Pod, PodSpec, Probe, ResourceRequirements, Secret,
            Service, ServicePort, Volume,
        },
        discovery::v1::EndpointSlice,
    },
    apimachinery::{
        self,
        pkg::{api::resource::Quantity, util::intstr::IntOrString},
    },
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    Client, Error, Resource,
};
