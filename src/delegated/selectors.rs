//! Selectors naming a workload by its attested attributes.

use std::fmt;

use crate::proto::spire::api::types::Selector as ProtoSelector;

const K8S_TYPE: &str = "k8s";
const UNIX_TYPE: &str = "unix";

const K8S_NS_TYPE: &str = "ns";
const K8S_SA_TYPE: &str = "sa";
const K8S_POD_NAME_TYPE: &str = "pod-name";
const K8S_POD_UID_TYPE: &str = "pod-uid";

const UNIX_UID_TYPE: &str = "uid";
const UNIX_GID_TYPE: &str = "gid";
const UNIX_PID_TYPE: &str = "pid";

/// A workload attribute as attested by a SPIRE agent plugin.
///
/// The broker ANDs every selector in a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    /// Kubernetes workload attestor selectors.
    K8s(K8s),
    /// Unix workload attestor selectors.
    Unix(Unix),
    /// Any other attestor, as raw type and value.
    Generic {
        /// Selector type, e.g. `docker`.
        kind: String,
        /// Selector value, e.g. `label:app:web`.
        value: String,
    },
}

/// Kubernetes selectors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum K8s {
    /// `ns:<namespace>`
    Namespace(String),
    /// `sa:<service account>`
    ServiceAccount(String),
    /// `pod-name:<name>`
    PodName(String),
    /// `pod-uid:<uid>`
    PodUid(String),
}

/// Unix process selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unix {
    /// `uid:<uid>`
    Uid(u32),
    /// `gid:<gid>`
    Gid(u32),
    /// `pid:<pid>`
    Pid(u32),
}

impl Selector {
    /// The namespace and service-account pair that names a Kubernetes
    /// workload.
    pub fn k8s_workload(namespace: impl Into<String>, service_account: impl Into<String>) -> [Self; 2] {
        [
            Self::K8s(K8s::Namespace(namespace.into())),
            Self::K8s(K8s::ServiceAccount(service_account.into())),
        ]
    }

    /// The selector type sent on the wire.
    pub fn kind(&self) -> &str {
        match self {
            Self::K8s(_) => K8S_TYPE,
            Self::Unix(_) => UNIX_TYPE,
            Self::Generic { kind, .. } => kind,
        }
    }

    /// The selector value sent on the wire.
    pub fn value(&self) -> String {
        match self {
            Self::K8s(k8s) => k8s.to_string(),
            Self::Unix(unix) => unix.to_string(),
            Self::Generic { value, .. } => value.clone(),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.value())
    }
}

impl fmt::Display for K8s {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace(v) => write!(f, "{K8S_NS_TYPE}:{v}"),
            Self::ServiceAccount(v) => write!(f, "{K8S_SA_TYPE}:{v}"),
            Self::PodName(v) => write!(f, "{K8S_POD_NAME_TYPE}:{v}"),
            Self::PodUid(v) => write!(f, "{K8S_POD_UID_TYPE}:{v}"),
        }
    }
}

impl fmt::Display for Unix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uid(v) => write!(f, "{UNIX_UID_TYPE}:{v}"),
            Self::Gid(v) => write!(f, "{UNIX_GID_TYPE}:{v}"),
            Self::Pid(v) => write!(f, "{UNIX_PID_TYPE}:{v}"),
        }
    }
}

impl From<&Selector> for ProtoSelector {
    fn from(s: &Selector) -> Self {
        Self {
            r#type: s.kind().to_owned(),
            value: s.value(),
        }
    }
}
