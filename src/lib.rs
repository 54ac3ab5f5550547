//! kube-dynamic-informer keeps a list-watch cache for every resource type
//! served by any tenant (workspace) of a multi-tenant apiserver,
//! e.g. start watching a new GVR when a tenant installs a CRD
//! and stop watching it when the last tenant removes it.
//!
//! Discovery runs once at startup until it succeeds, then on a fixed interval.
//! Each pass unions the namespaced, list+watchable types of all tenants
//! and reconciles the set of running watches against it.
//! Every change observed by any watch is passed on to the registered [`Listener`]s,
//! and synced caches are readable through [`DynamicInformer::ready_snapshots`].

pub mod config;
pub use config::{Config, ConfigError};
pub mod fanout;
pub use fanout::{EventKind, Listener, ListenerFuncs};
mod informer;
pub use informer::{DynamicInformer, StartError};
pub mod registry;
pub use registry::{Reconciled, RegistryError, WatchRegistry};
mod runner;
pub use runner::DiscoveryError;
pub mod source;
mod task;
pub mod types;
pub use types::{DiscoveredSet, QualifiedName, ResourceTypeDescriptor, ResourceTypeKey, TenantId};
pub mod watch;
pub use watch::{Phase, Snapshot};
