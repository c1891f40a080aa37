//! The SSH key manager. Generates agent and ephemeral key
//! pairs, encodes them into the opaque secret schema shared with the rsync
//! pool image, and maintains authorized-keys lines tagged by session id so a
//! single session's access can be revoked surgically.
//!
//! Secret/pod access is abstracted behind [`SecretStore`] and [`PodExec`] so
//! this module stays testable without a live cluster; `cluster_client`
//! supplies the real implementations.

use crate::util::Error;
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::{HashAlg, LineEnding, PrivateKey};
use std::collections::BTreeMap;

pub const AGENT_KEY_BITS: usize = 4096;
pub const EPHEMERAL_KEY_BITS: usize = 2048;

pub const SECRET_KEY_PRIVATE: &str = "private";
pub const SECRET_KEY_PUBLIC: &str = "public";
pub const SECRET_KEY_AUTHORIZED_KEYS: &str = "authorized_keys";
pub const SECRET_KEY_FINGERPRINT: &str = "fingerprint";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPair {
    pub private_pem: String,
    pub public_openssh: String,
    pub fingerprint: String,
}

impl KeyPair {
    /// Generates an RSA key pair of at least `bits` bits. Agent keys use
    /// 4096, ephemeral keys use 2048; both satisfy the minimum 2048-bit
    /// floor.
    pub fn generate(bits: usize) -> Result<Self, Error> {
        let rsa_private = RsaPrivateKey::new(&mut OsRng, bits)?;
        let rsa_keypair = RsaKeypair::try_from(rsa_private)?;
        let ssh_private = PrivateKey::new(KeypairData::Rsa(rsa_keypair), "dr-syncer")
            .map_err(|e| Error::SshKey(e.to_string()))?;
        let public_openssh = ssh_private
            .public_key()
            .to_openssh()
            .map_err(|e| Error::SshKey(e.to_string()))?;
        let fingerprint = ssh_private.public_key().fingerprint(HashAlg::Sha256).to_string();
        let private_pem = ssh_private
            .to_openssh(LineEnding::LF)
            .map_err(|e| Error::SshKey(e.to_string()))?
            .to_string();
        Ok(Self {
            private_pem,
            public_openssh,
            fingerprint,
        })
    }

    /// The opaque secret data schema this pair is stored under.
    /// `authorized_keys` starts empty; callers append lines via
    /// [`append_authorized_key`].
    pub fn secret_data(&self) -> BTreeMap<String, Vec<u8>> {
        BTreeMap::from([
            (SECRET_KEY_PRIVATE.to_string(), self.private_pem.clone().into_bytes()),
            (SECRET_KEY_PUBLIC.to_string(), self.public_openssh.clone().into_bytes()),
            (SECRET_KEY_AUTHORIZED_KEYS.to_string(), Vec::new()),
            (SECRET_KEY_FINGERPRINT.to_string(), self.fingerprint.clone().into_bytes()),
        ])
    }
}

/// Appends `public_key` to an authorized-keys file body, tagged with
/// `session_id` as a trailing comment so [`revoke_tagged`] can find it again.
/// Idempotent: re-appending the same (key, tag) pair is a no-op.
pub fn append_authorized_key(existing: &str, public_key: &str, session_id: &str) -> String {
    let line = format!("{} dr-syncer-session={session_id}", public_key.trim());
    if existing.lines().any(|l| l == line) {
        return existing.to_string();
    }
    let mut out = existing.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&line);
    out.push('\n');
    out
}

/// Removes every line tagged with `session_id`, leaving everything else
/// untouched.
pub fn revoke_tagged(existing: &str, session_id: &str) -> String {
    let tag = format!("dr-syncer-session={session_id}");
    existing
        .lines()
        .filter(|line| !line.ends_with(&tag))
        .map(|line| format!("{line}\n"))
        .collect()
}

/// Storage for the opaque agent/ephemeral key secrets. One
/// instance covers a single (cluster, namespace) scope.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error>;
    async fn put(&self, name: &str, data: BTreeMap<String, Vec<u8>>) -> Result<(), Error>;
    async fn delete(&self, name: &str) -> Result<(), Error>;
    /// Bumps an annotation on the DaemonSet pod template so subscribers pick
    /// up a rotated secret mount.
    async fn notify_rotation(&self, name: &str) -> Result<(), Error>;
}

/// Authorized-keys manipulation on a remote pod, via exec.
#[async_trait::async_trait]
pub trait PodExec: Send + Sync {
    async fn append_authorized_key(&self, pod: &str, public_key: &str, session_id: &str) -> Result<(), Error>;
    async fn revoke_authorized_key(&self, pod: &str, session_id: &str) -> Result<(), Error>;
}

fn agent_secret_name(cluster: &str) -> String {
    format!("dr-syncer-agent-key-{cluster}")
}

/// The path inside a pool/producer pod holding the authorized-keys file the
/// dispatch script's `sshd` consults. Lives in the container's
/// writable layer, distinct from the read-only-mounted agent key secret.
pub const AUTHORIZED_KEYS_PATH: &str = "/etc/ssh/authorized_keys";

/// A bump annotation the DaemonSet's pod template carries so a secret
/// rotation forces a template diff even though the secret name itself
/// doesn't change.
pub const ROTATION_ANNOTATION: &str = "dr-syncer.io/agent-key-generation";

/// [`SecretStore`] backed by a real cluster's Secret API.
pub struct KubeSecretStore {
    client: kube::Client,
    namespace: String,
}

impl KubeSecretStore {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self { client, namespace: namespace.to_string() }
    }

    fn api(&self) -> kube::Api<k8s_openapi::api::core::v1::Secret> {
        kube::Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait::async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, name: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error> {
        match self.api().get(name).await {
            Ok(secret) => Ok(Some(
                secret
                    .data
                    .map(|d| d.into_iter().map(|(k, v)| (k, v.0)).collect())
                    .unwrap_or_default(),
            )),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, name: &str, data: BTreeMap<String, Vec<u8>>) -> Result<(), Error> {
        use k8s_openapi::ByteString;
        use k8s_openapi::api::core::v1::Secret;
        use kube::api::{ObjectMeta, Patch, PatchParams};

        let secret = Secret {
            metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
            data: Some(data.into_iter().map(|(k, v)| (k, ByteString(v))).collect()),
            ..Default::default()
        };
        self.api()
            .patch(name, &PatchParams::apply("dr-syncer-ssh-keys").force(), &Patch::Apply(&secret))
            .await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        match self.api().delete(name, &kube::api::DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn notify_rotation(&self, _name: &str) -> Result<(), Error> {
        // Real rotation-propagation is a pod-template annotation bump on the
        // DaemonSet, done by the caller (rsync_pool reconcile), not here.
        // This store only owns the secret itself.
        Ok(())
    }
}

/// [`PodExec`] that manipulates a pod's authorized-keys file over
/// [`ClusterClient::exec`] with plain shell one-liners (the pool image
/// ships no richer RPC surface).
pub struct KubePodExec<'a> {
    cluster: &'a crate::cluster_client::ClusterClient,
    namespace: String,
}

impl<'a> KubePodExec<'a> {
    pub fn new(cluster: &'a crate::cluster_client::ClusterClient, namespace: &str) -> Self {
        Self { cluster, namespace: namespace.to_string() }
    }
}

#[async_trait::async_trait]
impl<'a> PodExec for KubePodExec<'a> {
    async fn append_authorized_key(&self, pod: &str, public_key: &str, session_id: &str) -> Result<(), Error> {
        let line = format!("{} dr-syncer-session={session_id}", public_key.trim());
        let script = format!(
            "grep -qxF '{line}' {AUTHORIZED_KEYS_PATH} 2>/dev/null || echo '{line}' >> {AUTHORIZED_KEYS_PATH}"
        );
        let result = self
            .cluster
            .exec(&self.namespace, pod, None, vec!["sh".to_string(), "-c".to_string(), script])
            .await?;
        if !result.success {
            return Err(Error::SshKey(format!("KEY-AUTHORIZE: {}", result.stderr)));
        }
        Ok(())
    }

    async fn revoke_authorized_key(&self, pod: &str, session_id: &str) -> Result<(), Error> {
        let script = format!("sed -i '/dr-syncer-session={session_id}$/d' {AUTHORIZED_KEYS_PATH}");
        let result = self
            .cluster
            .exec(&self.namespace, pod, None, vec!["sh".to_string(), "-c".to_string(), script])
            .await?;
        if !result.success {
            return Err(Error::SshKey(format!("failed to revoke session {session_id}: {}", result.stderr)));
        }
        Ok(())
    }
}

pub struct SshKeyManager<S, P> {
    secrets: S,
    exec: P,
}

impl<S: SecretStore, P: PodExec> SshKeyManager<S, P> {
    pub fn new(secrets: S, exec: P) -> Self {
        Self { secrets, exec }
    }

    /// Creates the agent pair if missing; returns a stable handle (the
    /// secret name) either way.
    pub async fn ensure_agent_pair(&self, cluster: &str) -> Result<String, Error> {
        let name = agent_secret_name(cluster);
        if self.secrets.get(&name).await?.is_none() {
            let pair = KeyPair::generate(AGENT_KEY_BITS)?;
            self.secrets.put(&name, pair.secret_data()).await?;
        }
        Ok(name)
    }

    /// Atomic delete-then-create, notifying subscribers afterwards so
    /// DaemonSet pods refresh their mounted secret.
    pub async fn rotate_agent_pair(&self, cluster: &str) -> Result<String, Error> {
        let name = agent_secret_name(cluster);
        self.secrets.delete(&name).await?;
        let pair = KeyPair::generate(AGENT_KEY_BITS)?;
        self.secrets.put(&name, pair.secret_data()).await?;
        self.secrets.notify_rotation(&name).await?;
        Ok(name)
    }

    /// Reads back the fingerprint stored alongside an agent pair, for
    /// status reporting. `None` if the pair doesn't exist yet.
    pub async fn agent_fingerprint(&self, cluster: &str) -> Result<Option<String>, Error> {
        let name = agent_secret_name(cluster);
        let Some(data) = self.secrets.get(&name).await? else {
            return Ok(None);
        };
        Ok(data
            .get(SECRET_KEY_FINGERPRINT)
            .map(|bytes| String::from_utf8_lossy(bytes).to_string()))
    }

    /// Single-use pair for one sync session; the caller is responsible for
    /// destroying it once the session closes (it is never persisted here).
    pub fn issue_ephemeral_pair(&self) -> Result<KeyPair, Error> {
        KeyPair::generate(EPHEMERAL_KEY_BITS)
    }

    /// Appends `public_key` on `pod`'s authorized-keys file, tagged with
    /// `session_id`. Fails with [`Error::SshKey`] (classified `auth`) if the
    /// source cluster has no agent pair.
    pub async fn authorize(&self, cluster: &str, pod: &str, public_key: &str, session_id: &str) -> Result<(), Error> {
        let name = agent_secret_name(cluster);
        if self.secrets.get(&name).await?.is_none() {
            return Err(Error::SshKey(format!("KEY-MISSING: no agent pair for cluster {cluster}")));
        }
        self.exec
            .append_authorized_key(pod, public_key, session_id)
            .await
            .map_err(|_| Error::SshKey(format!("KEY-AUTHORIZE: failed to authorize session {session_id} on pod {pod}")))
    }

    pub async fn revoke(&self, pod: &str, session_id: &str) -> Result<(), Error> {
        self.exec.revoke_authorized_key(pod, session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_agent_pair_meets_bit_floor_and_has_all_secret_fields() {
        let pair = KeyPair::generate(AGENT_KEY_BITS).unwrap();
        let data = pair.secret_data();
        assert!(data.contains_key(SECRET_KEY_PRIVATE));
        assert!(data.contains_key(SECRET_KEY_PUBLIC));
        assert!(data.contains_key(SECRET_KEY_AUTHORIZED_KEYS));
        assert!(data.contains_key(SECRET_KEY_FINGERPRINT));
        assert!(pair.public_openssh.starts_with("ssh-rsa"));
        assert!(!pair.fingerprint.is_empty());
    }

    #[test]
    fn append_authorized_key_is_idempotent() {
        let key = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAAB demo";
        let once = append_authorized_key("", key, "sess-1");
        let twice = append_authorized_key(&once, key, "sess-1");
        assert_eq!(once, twice);
        assert_eq!(once.lines().count(), 1);
    }

    #[test]
    fn append_authorized_key_preserves_unrelated_lines() {
        let existing = "ssh-ed25519 AAAA other-user\n";
        let out = append_authorized_key(existing, "ssh-rsa AAAAKEY", "sess-2");
        assert!(out.contains("other-user"));
        assert!(out.contains("dr-syncer-session=sess-2"));
    }

    #[test]
    fn revoke_tagged_removes_only_matching_session_lines() {
        let key_a = "ssh-rsa AAAAKEYA";
        let key_b = "ssh-rsa AAAAKEYB";
        let existing = append_authorized_key(
            &append_authorized_key("", key_a, "sess-1"),
            key_b,
            "sess-2",
        );
        let out = revoke_tagged(&existing, "sess-1");
        assert!(!out.contains("sess-1"));
        assert!(out.contains("sess-2"));
    }

    #[test]
    fn revoke_tagged_on_empty_file_is_empty() {
        assert_eq!(revoke_tagged("", "sess-1"), "");
    }

    struct FakeSecrets {
        store: tokio::sync::Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
        rotations: tokio::sync::Mutex<Vec<String>>,
    }

    impl FakeSecrets {
        fn new() -> Self {
            Self {
                store: tokio::sync::Mutex::new(BTreeMap::new()),
                rotations: tokio::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl SecretStore for FakeSecrets {
        async fn get(&self, name: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error> {
            Ok(self.store.lock().await.get(name).cloned())
        }
        async fn put(&self, name: &str, data: BTreeMap<String, Vec<u8>>) -> Result<(), Error> {
            self.store.lock().await.insert(name.to_string(), data);
            Ok(())
        }
        async fn delete(&self, name: &str) -> Result<(), Error> {
            self.store.lock().await.remove(name);
            Ok(())
        }
        async fn notify_rotation(&self, name: &str) -> Result<(), Error> {
            self.rotations.lock().await.push(name.to_string());
            Ok(())
        }
    }

    struct FakeExec {
        authorized: tokio::sync::Mutex<Vec<(String, String, String)>>,
        revoked: tokio::sync::Mutex<Vec<(String, String)>>,
    }

    impl FakeExec {
        fn new() -> Self {
            Self {
                authorized: tokio::sync::Mutex::new(Vec::new()),
                revoked: tokio::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl PodExec for FakeExec {
        async fn append_authorized_key(&self, pod: &str, public_key: &str, session_id: &str) -> Result<(), Error> {
            self.authorized
                .lock()
                .await
                .push((pod.to_string(), public_key.to_string(), session_id.to_string()));
            Ok(())
        }
        async fn revoke_authorized_key(&self, pod: &str, session_id: &str) -> Result<(), Error> {
            self.revoked.lock().await.push((pod.to_string(), session_id.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn ensure_agent_pair_creates_once_and_is_stable_on_replay() {
        let mgr = SshKeyManager::new(FakeSecrets::new(), FakeExec::new());
        let handle_a = mgr.ensure_agent_pair("dr-west").await.unwrap();
        let handle_b = mgr.ensure_agent_pair("dr-west").await.unwrap();
        assert_eq!(handle_a, handle_b);
        assert!(mgr.secrets.get(&handle_a).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rotate_agent_pair_replaces_material_and_notifies() {
        let mgr = SshKeyManager::new(FakeSecrets::new(), FakeExec::new());
        mgr.ensure_agent_pair("dr-west").await.unwrap();
        let before = mgr.secrets.get("dr-syncer-agent-key-dr-west").await.unwrap().unwrap();
        mgr.rotate_agent_pair("dr-west").await.unwrap();
        let after = mgr.secrets.get("dr-syncer-agent-key-dr-west").await.unwrap().unwrap();
        assert_ne!(before[SECRET_KEY_PRIVATE], after[SECRET_KEY_PRIVATE]);
        assert_eq!(mgr.secrets.rotations.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn authorize_fails_with_key_missing_when_no_agent_pair() {
        let mgr = SshKeyManager::new(FakeSecrets::new(), FakeExec::new());
        let err = mgr
            .authorize("dr-west", "pod-a", "ssh-rsa AAAA", "sess-1")
            .await
            .unwrap_err();
        match err {
            Error::SshKey(msg) => assert!(msg.contains("KEY-MISSING")),
            other => panic!("expected SshKey error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn authorize_succeeds_once_agent_pair_exists() {
        let mgr = SshKeyManager::new(FakeSecrets::new(), FakeExec::new());
        mgr.ensure_agent_pair("dr-west").await.unwrap();
        mgr.authorize("dr-west", "pod-a", "ssh-rsa AAAA", "sess-1").await.unwrap();
        assert_eq!(mgr.exec.authorized.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn agent_fingerprint_is_absent_before_ensure_and_present_after() {
        let mgr = SshKeyManager::new(FakeSecrets::new(), FakeExec::new());
        assert!(mgr.agent_fingerprint("dr-west").await.unwrap().is_none());
        mgr.ensure_agent_pair("dr-west").await.unwrap();
        let fingerprint = mgr.agent_fingerprint("dr-west").await.unwrap().unwrap();
        assert!(!fingerprint.is_empty());
    }

    #[tokio::test]
    async fn issue_ephemeral_pair_does_not_touch_secret_store() {
        let mgr = SshKeyManager::new(FakeSecrets::new(), FakeExec::new());
        let pair = mgr.issue_ephemeral_pair().unwrap();
        assert!(!pair.public_openssh.is_empty());
    }
}
