//! Labels, annotations and well-known paths shared across components

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "registry-cache-operator";

/// Labels placed on managed objects
pub mod labels {
    /// Workload selector label, value is the cache name
    pub const APP: &str = "app";
    /// Marks a Service as a cache endpoint, value is the cache name
    pub const UPSTREAM_HOST: &str = "registry-cache.extensions.io/upstream-host";
    /// Name of the bundle an object belongs to
    pub const BUNDLE: &str = "registry-cache.extensions.io/bundle";
    /// Standard managed-by label
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
}

/// Annotations placed on managed objects
pub mod annotations {
    /// Upstream (host[:port]) served by a cache endpoint
    pub const UPSTREAM: &str = "registry-cache.extensions.io/upstream";
    /// Content version of a published bundle
    pub const BUNDLE_VERSION: &str = "registry-cache.extensions.io/bundle-version";
    /// Digest of the rendered mirror artifact
    pub const ARTIFACT_DIGEST: &str = "registry-cache.extensions.io/artifact-digest";
}

/// Names and paths on the node
pub mod host {
    /// Directory containerd imports configuration fragments from
    pub const IMPORTS_DIR: &str = "/etc/containerd/conf.d";
    /// containerd base configuration
    pub const RUNTIME_CONFIG: &str = "/etc/containerd/config.toml";
    /// File name of the mirror fragment, both in the ConfigMap and on the host
    pub const FRAGMENT_NAME: &str = "zz-extension-registry-cache.toml";
    /// systemd unit of the container runtime
    pub const RUNTIME_SERVICE: &str = "containerd.service";
    /// Mount point of the host root filesystem inside the agent container
    pub const HOST_ROOT: &str = "/host";
    /// Mount point of the agent ConfigMap inside the agent container
    pub const WORK_DIR: &str = "/work";
}
