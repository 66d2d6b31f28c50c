pub mod error;
pub mod forwarder;
pub mod kube;
pub mod pump;

pub use error::ForwardError;
pub use forwarder::Forwarder;
pub use self::kube::cache::{
    KubeCache,
    PodEndpoint,
};
pub use self::kube::client::{
    ClientFactory,
    KubeconfigClientFactory,
};
