//! TLS secret store and certificate index.
//!
//! The store is the single owner of parsed certificates: raw secret
//! bundles come in over the watch, parse into rustls certified keys plus
//! leaf metadata, and are handed out to the host → certificate index that
//! SNI selection walks. Entries are shared with the owning ingress's
//! lifecycle: the ingress reconciler adds and removes them, the secret
//! reconciler refreshes their certificates in place.

use crate::processor::IndexResource;
use ahash::AHashMap as HashMap;
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    sign::CertifiedKey,
};
use serde_json::{json, Value};
use slipway_core::{route::wildcard_host, IngressRef, SecretRef};
use slipway_k8s_api::{self as k8s, ResourceExt};
use std::{fmt, net::IpAddr, sync::Arc};

const TLS_CERT_KEY: &str = "tls.crt";
const TLS_PRIVATE_KEY: &str = "tls.key";

/// A parsed server certificate: the rustls key pair for handshakes plus
/// the leaf metadata that selection and the status report need.
pub struct Cert {
    pub certified: Arc<CertifiedKey>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub issuer: String,
    pub subject: String,
}

// === impl Cert ===

impl Cert {
    pub fn valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }

    fn status(&self) -> Value {
        let mut doc = json!({
            "notBefore": self.not_before.to_rfc3339(),
            "notAfter": self.not_after.to_rfc3339(),
            "issuer": self.issuer,
            "subject": self.subject,
        });
        if !self.dns_names.is_empty() {
            doc["dnsNames"] = json!(self.dns_names);
        }
        if !self.ip_addresses.is_empty() {
            doc["ipAddresses"] = json!(self
                .ip_addresses
                .iter()
                .map(|ip| ip.to_string())
                .collect::<Vec<_>>());
        }
        doc
    }
}

impl fmt::Debug for Cert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cert")
            .field("subject", &self.subject)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// One (host, secret, owning ingress) registration. Defaults have no
/// owner. The certificate pointer is replaced in place when the secret
/// changes.
#[derive(Debug)]
pub struct CertEntry {
    secret: SecretRef,
    ingress: Option<IngressRef>,
    state: RwLock<CertState>,
}

#[derive(Debug, Default)]
struct CertState {
    cert: Option<Arc<Cert>>,
    error: Option<String>,
}

impl CertEntry {
    fn status(&self) -> Value {
        let state = self.state.read();
        let mut doc = json!({ "secret": self.secret.to_string() });
        if let Some(ingress) = &self.ingress {
            doc["ingress"] = json!(ingress.to_string());
        }
        doc["cert"] = match &state.cert {
            Some(cert) => cert.status(),
            None => Value::Null,
        };
        if let Some(error) = &state.error {
            doc["error"] = json!(error);
        }
        doc
    }

    /// Replaces the certificate, keeping the previous one when a new
    /// version fails to parse.
    fn refresh(&self, cert: Option<Arc<Cert>>, error: Option<String>) {
        let mut state = self.state.write();
        if let Some(cert) = cert {
            state.cert = Some(cert);
        }
        state.error = error;
    }

    fn clear(&self, error: impl ToString) {
        let mut state = self.state.write();
        state.cert = None;
        state.error = Some(error.to_string());
    }
}

#[derive(Clone)]
struct KeyPairBytes {
    crt: Vec<u8>,
    key: Vec<u8>,
}

#[derive(Default)]
struct ParseOutcome {
    cert: Option<Arc<Cert>>,
    error: Option<String>,
}

#[derive(Default)]
struct CertIndex {
    by_host: HashMap<String, Vec<Arc<CertEntry>>>,
    defaults: Vec<Arc<CertEntry>>,
}

/// The certificate store shared by the ingress and secret reconcilers and
/// the TLS acceptor.
pub struct CertStore {
    secrets: RwLock<HashMap<SecretRef, KeyPairBytes>>,
    parsed: RwLock<HashMap<SecretRef, ParseOutcome>>,
    index: RwLock<CertIndex>,

    client_secret: Option<SecretRef>,
    client_cert: RwLock<Option<Arc<Cert>>>,
}

// === impl CertStore ===

impl CertStore {
    /// `defaults` is the ordered list of fallback certificate secrets;
    /// `client_secret` optionally provides a client certificate for
    /// upstream mTLS.
    pub fn new(defaults: Vec<SecretRef>, client_secret: Option<SecretRef>) -> Arc<Self> {
        let store = Self {
            secrets: RwLock::default(),
            parsed: RwLock::default(),
            index: RwLock::default(),
            client_secret,
            client_cert: RwLock::default(),
        };
        {
            let mut index = store.index.write();
            for secret in defaults {
                let (cert, error) = store.resolve_secret(&secret);
                index.defaults.push(Arc::new(CertEntry {
                    secret,
                    ingress: None,
                    state: RwLock::new(CertState { cert, error }),
                }));
            }
        }
        Arc::new(store)
    }

    /// Ingests a secret from the watch. Bundles without both `tls.crt`
    /// and `tls.key` are ignored silently.
    pub fn apply_secret(&self, secret: k8s::Secret) -> Result<()> {
        let key = SecretRef::new(secret.namespace().unwrap_or_default(), secret.name_any());
        let Some(data) = &secret.data else {
            return Ok(());
        };
        let (Some(crt), Some(pkey)) = (data.get(TLS_CERT_KEY), data.get(TLS_PRIVATE_KEY)) else {
            return Ok(());
        };

        tracing::info!(secret = %key, "secret added");
        let pair = KeyPairBytes {
            crt: crt.0.clone(),
            key: pkey.0.clone(),
        };
        self.secrets.write().insert(key.clone(), pair.clone());

        let outcome = match parse_keypair(&pair.crt, &pair.key) {
            Ok(cert) => (Some(cert), None),
            Err(error) => {
                tracing::warn!(secret = %key, %error, "keypair error");
                (None, Some(error.to_string()))
            }
        };
        self.install(&key, outcome);
        Ok(())
    }

    pub fn delete_secret(&self, key: &SecretRef) {
        tracing::info!(secret = %key, "secret deleted");
        self.secrets.write().remove(key);
        self.parsed.write().remove(key);

        let index = self.index.read();
        for entry in index.entries() {
            if &entry.secret == key {
                entry.clear("secret deleted");
            }
        }
        drop(index);

        if self.client_secret.as_ref() == Some(key) {
            *self.client_cert.write() = None;
        }
    }

    /// Replaces every cert-index entry owned by `ingress` with one entry
    /// per (host, secret) pair, resolving secrets outside the index lock.
    pub fn update_ingress(&self, ingress: &IngressRef, hosts: Vec<(String, SecretRef)>) {
        let fresh: Vec<(String, Arc<CertEntry>)> = hosts
            .into_iter()
            .map(|(host, secret)| {
                let (cert, error) = self.resolve_secret(&secret);
                let entry = Arc::new(CertEntry {
                    secret,
                    ingress: Some(ingress.clone()),
                    state: RwLock::new(CertState { cert, error }),
                });
                (host, entry)
            })
            .collect();

        let mut index = self.index.write();
        index.remove_owned(ingress);
        for (host, entry) in fresh {
            index.by_host.entry(host).or_default().push(entry);
        }
    }

    pub fn remove_ingress(&self, ingress: &IngressRef) {
        self.index.write().remove_owned(ingress);
    }

    /// SNI selection: over the exact-host, wildcard-host, and default
    /// buckets in that order, prefer a currently-valid certificate the
    /// client supports; failing that accept an expired-but-supported one;
    /// failing that hand back the first default so the operator at least
    /// sees *a* certificate rather than a dropped handshake.
    pub fn resolve(
        &self,
        server_name: &str,
        supports: impl Fn(&Cert) -> bool,
    ) -> Option<Arc<Cert>> {
        let index = self.index.read();
        let wildcard = wildcard_host(server_name);
        let empty = Vec::new();
        let buckets = [
            index.by_host.get(server_name).unwrap_or(&empty),
            index.by_host.get(&wildcard).unwrap_or(&empty),
            &index.defaults,
        ];

        let now = Utc::now();
        for bucket in buckets {
            for entry in bucket {
                let state = entry.state.read();
                if let Some(cert) = &state.cert {
                    if cert.valid_at(now) && supports(cert) {
                        return Some(cert.clone());
                    }
                }
            }
        }

        // Expiry is soft: an expired-but-supported certificate beats a
        // failed handshake.
        for bucket in buckets {
            for entry in bucket {
                let state = entry.state.read();
                if let Some(cert) = &state.cert {
                    if supports(cert) {
                        return Some(cert.clone());
                    }
                }
            }
        }

        index
            .defaults
            .iter()
            .find_map(|entry| entry.state.read().cert.clone())
    }

    /// The client certificate presented to upstream backends, when
    /// configured.
    pub fn client_cert(&self) -> Option<Arc<Cert>> {
        self.client_cert.read().clone()
    }

    /// Number of hosts with at least one certificate entry.
    pub fn len(&self) -> usize {
        self.index.read().by_host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().by_host.is_empty()
    }

    /// The `/status` view of the certificate mapping, defaults included.
    pub fn to_status(&self) -> Value {
        let index = self.index.read();
        let hosts: serde_json::Map<String, Value> = index
            .by_host
            .iter()
            .map(|(host, entries)| {
                let entries: Vec<Value> = entries.iter().map(|e| e.status()).collect();
                (host.clone(), Value::Array(entries))
            })
            .collect();
        let defaults: Vec<Value> = index.defaults.iter().map(|e| e.status()).collect();
        json!({ "hosts": hosts, "defaults": defaults })
    }

    /// Looks a secret up in the parse cache, falling back to parsing the
    /// raw bundle. Absence is not cached so a late-arriving secret fills
    /// in on its watch event.
    fn resolve_secret(&self, key: &SecretRef) -> (Option<Arc<Cert>>, Option<String>) {
        if let Some(outcome) = self.parsed.read().get(key) {
            return (outcome.cert.clone(), outcome.error.clone());
        }

        let Some(pair) = self.secrets.read().get(key).cloned() else {
            return (None, Some("secret not found".to_string()));
        };

        let outcome = match parse_keypair(&pair.crt, &pair.key) {
            Ok(cert) => (Some(cert), None),
            Err(error) => {
                tracing::warn!(secret = %key, %error, "keypair error");
                (None, Some(error.to_string()))
            }
        };
        self.install(key, outcome.clone());
        outcome
    }

    /// Records a parse outcome in the cache and refreshes every live
    /// entry (and the client certificate) referencing the secret.
    fn install(&self, key: &SecretRef, (cert, error): (Option<Arc<Cert>>, Option<String>)) {
        {
            let mut parsed = self.parsed.write();
            let slot = parsed.entry(key.clone()).or_default();
            if let Some(cert) = cert.clone() {
                slot.cert = Some(cert);
            }
            slot.error = error.clone();
        }

        let index = self.index.read();
        for entry in index.entries() {
            if &entry.secret == key {
                entry.refresh(cert.clone(), error.clone());
            }
        }
        drop(index);

        if self.client_secret.as_ref() == Some(key) {
            if let Some(cert) = cert {
                *self.client_cert.write() = Some(cert);
            }
        }
    }
}

impl fmt::Debug for CertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertStore")
            .field("hosts", &self.index.read().by_host.len())
            .field("defaults", &self.index.read().defaults.len())
            .finish_non_exhaustive()
    }
}

// === impl CertIndex ===

impl CertIndex {
    fn entries(&self) -> impl Iterator<Item = &Arc<CertEntry>> {
        self.by_host
            .values()
            .flatten()
            .chain(self.defaults.iter())
    }

    fn remove_owned(&mut self, ingress: &IngressRef) {
        self.by_host.retain(|_, entries| {
            entries.retain(|entry| entry.ingress.as_ref() != Some(ingress));
            !entries.is_empty()
        });
    }
}

/// Feeds the secret watch into the store.
#[derive(Debug)]
pub struct SecretIndex {
    store: Arc<CertStore>,
}

// === impl SecretIndex ===

impl SecretIndex {
    pub fn shared(store: Arc<CertStore>) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(Self { store }))
    }
}

impl IndexResource<k8s::Secret> for SecretIndex {
    fn apply(&mut self, secret: k8s::Secret) -> Result<()> {
        self.store.apply_secret(secret)
    }

    fn delete(&mut self, namespace: String, name: String) -> Result<()> {
        self.store.delete_secret(&SecretRef::new(namespace, name));
        Ok(())
    }
}

/// Parses a PEM cert chain and private key into a certified key plus the
/// leaf metadata used by selection and the status report.
fn parse_keypair(crt: &[u8], key: &[u8]) -> Result<Arc<Cert>> {
    let chain: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &*crt).collect::<Result<_, _>>()?;
    if chain.is_empty() {
        bail!("tls.crt holds no certificates");
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &*key)?
        .ok_or_else(|| anyhow!("tls.key holds no private key"))?;
    let signing = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|error| anyhow!("unsupported private key: {error}"))?;

    let (_, leaf) = x509_parser::parse_x509_certificate(chain[0].as_ref())
        .map_err(|error| anyhow!("parsing leaf certificate: {error}"))?;

    let not_before = DateTime::<Utc>::from_timestamp(leaf.validity().not_before.timestamp(), 0)
        .ok_or_else(|| anyhow!("leaf notBefore out of range"))?;
    let not_after = DateTime::<Utc>::from_timestamp(leaf.validity().not_after.timestamp(), 0)
        .ok_or_else(|| anyhow!("leaf notAfter out of range"))?;

    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();
    if let Ok(Some(san)) = leaf.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                x509_parser::extensions::GeneralName::DNSName(dns) => {
                    dns_names.push(dns.to_string());
                }
                x509_parser::extensions::GeneralName::IPAddress(octets) => {
                    if let Ok(o) = <[u8; 4]>::try_from(*octets) {
                        ip_addresses.push(IpAddr::from(o));
                    } else if let Ok(o) = <[u8; 16]>::try_from(*octets) {
                        ip_addresses.push(IpAddr::from(o));
                    }
                }
                _ => {}
            }
        }
    }

    let issuer = leaf.issuer().to_string();
    let subject = leaf.subject().to_string();
    let certified = Arc::new(CertifiedKey::new(chain, signing));

    Ok(Arc::new(Cert {
        certified,
        not_before,
        not_after,
        dns_names,
        ip_addresses,
        issuer,
        subject,
    }))
}
