use anyhow::{bail, Result};
use serde::{Serialize, Serializer};
use std::fmt;

/// Identifies a service port backing one or more ingress rules.
///
/// `port` holds the service port name, or the decimal form of a port number
/// when the ingress referenced the port numerically. An empty `port` means
/// "any port": the endpoint pool then yields bare addresses.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
    pub port: String,
}

impl ServiceRef {
    pub fn new(namespace: impl ToString, name: impl ToString, port: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            port: port.to_string(),
        }
    }

    /// The portless form of this reference, keying the union view of the
    /// endpoint pool.
    pub fn portless(&self) -> Self {
        Self {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            port: String::new(),
        }
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port.is_empty() {
            write!(f, "{}/{}", self.namespace, self.name)
        } else {
            write!(f, "{}/{}:{}", self.namespace, self.name, self.port)
        }
    }
}

impl Serialize for ServiceRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl std::str::FromStr for ServiceRef {
    type Err = anyhow::Error;

    /// Parses `namespace/name`, as used by the `--default-backend` option.
    fn from_str(s: &str) -> Result<Self> {
        let Some((namespace, name)) = s.split_once('/') else {
            bail!("backend service must be in the form NAMESPACE/NAME");
        };
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            bail!("backend service must be in the form NAMESPACE/NAME");
        }
        Ok(Self::new(namespace, name, ""))
    }
}

/// Identifies a TLS secret.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

impl SecretRef {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl Serialize for SecretRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl std::str::FromStr for SecretRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((namespace, name)) = s.split_once('/') else {
            bail!("secret must be in the form NAMESPACE/NAME");
        };
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            bail!("secret must be in the form NAMESPACE/NAME");
        }
        Ok(Self::new(namespace, name))
    }
}

/// Identifies the ingress resource a rule or certificate entry came from.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct IngressRef {
    pub namespace: String,
    pub name: String,
}

impl IngressRef {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for IngressRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl Serialize for IngressRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A concrete backend address. A zero port means the endpoint came from the
/// portless view and no port is fixed.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: impl ToString, port: u16) -> Self {
        Self {
            addr: addr.to_string(),
            port,
        }
    }

    /// The `host:port` form used as the rewritten request authority.
    pub fn authority(&self) -> String {
        if self.addr.contains(':') {
            // Bare IPv6 addresses need brackets in an authority.
            format!("[{}]:{}", self.addr, self.port)
        } else {
            format!("{}:{}", self.addr, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 0 {
            f.write_str(&self.addr)
        } else {
            write!(f, "{}:{}", self.addr, self.port)
        }
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
