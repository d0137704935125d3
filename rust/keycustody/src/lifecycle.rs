use crate::config::Config;
use crate::context::CryptoContext;
use crate::error::{Error, Result};
use crate::key::KeyMaterial;
use crate::keyring::{KeyHandle, Keyring};
use crate::provider::{CryptoProvider, SystemProvider};
use crate::stream::{self, NONCE_LEN};
use log::{debug, error, info};
use parking_lot::RwLock;
use std::cell::RefCell;
use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_LIFECYCLE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Lifecycles whose key material this thread is currently lending out.
    static BORROWS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Records that key material of one lifecycle is lent to caller code on this
/// thread, until dropped.
struct Borrow(u64);

impl Borrow {
    fn enter(lifecycle: u64) -> Self {
        BORROWS.with(|b| b.borrow_mut().push(lifecycle));
        Self(lifecycle)
    }

    fn active(lifecycle: u64) -> bool {
        BORROWS.with(|b| b.borrow().contains(&lifecycle))
    }
}

impl Drop for Borrow {
    fn drop(&mut self) {
        BORROWS.with(|b| {
            let mut open = b.borrow_mut();
            if let Some(pos) = open.iter().rposition(|&id| id == self.0) {
                open.remove(pos);
            }
        });
    }
}

/// Observable phase of a [`KeyLifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Ready,
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

enum State {
    Uninitialized,
    Ready(CryptoContext),
    Terminated,
}

impl State {
    fn phase(&self) -> LifecycleState {
        match self {
            Self::Uninitialized => LifecycleState::Uninitialized,
            Self::Ready(_) => LifecycleState::Ready,
            Self::Terminated => LifecycleState::Terminated,
        }
    }
}

/// Owns the crypto context and the keyring for one process run.
///
/// The lifecycle moves `Uninitialized -> Ready -> Terminated` exactly once.
/// Key operations are only accepted while `Ready`; anywhere else they fail with
/// [`Error::LifecycleViolation`] before touching the allocator. Shutdown wipes
/// every key and then releases the pool. Dropping a `Ready` lifecycle performs
/// the same shutdown.
///
/// Key bytes are lent to caller code by [`with_key_bytes`](Self::with_key_bytes)
/// and to the `Read`/`Write` ends of the stream calls. That code must not call
/// back into the same lifecycle; such calls fail with [`Error::KeyBorrowed`]
/// instead of waiting on the lock the borrow holds.
///
/// ```no_run
/// use keycustody::{Config, KeyLifecycle};
/// use securepool::SecureMode;
///
/// # fn main() -> keycustody::Result<()> {
/// let lifecycle = KeyLifecycle::new(Config::new().with_secure_mode(SecureMode::Disabled))?;
/// lifecycle.initialize()?;
/// let key = lifecycle.generate()?;
///
/// let mut sealed: Vec<u8> = Vec::new();
/// lifecycle.encrypt_stream(&key, &mut &b"hello world"[..], &mut sealed)?;
///
/// lifecycle.shutdown()?;
/// # Ok(())
/// # }
/// ```
pub struct KeyLifecycle {
    id: u64,
    config: Config,
    provider: Arc<dyn CryptoProvider>,
    state: RwLock<State>,
    keyring: Keyring,
}

impl fmt::Debug for KeyLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLifecycle")
            .field("state", &self.state())
            .field("provider", &self.provider.name())
            .field("keys", &self.keyring.len())
            .finish_non_exhaustive()
    }
}

impl KeyLifecycle {
    /// Creates an uninitialized lifecycle backed by [`SystemProvider`].
    pub fn new(config: Config) -> Result<Self> {
        Self::with_provider(config, Arc::new(SystemProvider::new()))
    }

    /// Creates an uninitialized lifecycle backed by `provider`.
    ///
    /// # Errors
    ///
    /// `Error::Config` if `config` does not validate.
    pub fn with_provider(config: Config, provider: Arc<dyn CryptoProvider>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            id: NEXT_LIFECYCLE_ID.fetch_add(1, Ordering::Relaxed),
            config,
            provider,
            state: RwLock::new(State::Uninitialized),
            keyring: Keyring::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.state.read_recursive().phase()
    }

    /// Number of keyring entries.
    pub fn key_count(&self) -> usize {
        self.keyring.len()
    }

    /// Whether key buffers currently live in locked memory.
    pub fn secure_memory_active(&self) -> bool {
        match &*self.state.read_recursive() {
            State::Ready(ctx) => ctx.allocator().is_secure(),
            _ => false,
        }
    }

    /// Verifies the provider, configures the pool, and moves to `Ready`.
    ///
    /// # Errors
    ///
    /// * `Error::LifecycleViolation` unless the lifecycle is `Uninitialized`.
    /// * `Error::VersionMismatch` if the provider is too old or incompatible.
    /// * `Error::PoolAllocation` if the pool cannot be configured for the
    ///   requested mode.
    ///
    /// After a failure other than a violation the lifecycle stays
    /// `Uninitialized` and may be initialized again.
    pub fn initialize(&self) -> Result<()> {
        self.refuse_while_borrowed("initialize")?;
        let mut state = self.state.write();
        if !matches!(*state, State::Uninitialized) {
            return Err(Error::LifecycleViolation {
                operation: "initialize",
                state: state.phase(),
            });
        }

        let ctx = CryptoContext::establish(&self.config, Arc::clone(&self.provider))?;
        *state = State::Ready(ctx);
        Ok(())
    }

    fn refuse_while_borrowed(&self, operation: &'static str) -> Result<()> {
        if Borrow::active(self.id) {
            return Err(Error::KeyBorrowed { operation });
        }
        Ok(())
    }

    /// Runs `f` with the context while holding the state read lock.
    fn with_context<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&CryptoContext) -> Result<T>,
    ) -> Result<T> {
        self.refuse_while_borrowed(operation)?;
        let state = self.state.read();
        match &*state {
            State::Ready(ctx) => f(ctx),
            other => Err(Error::LifecycleViolation {
                operation,
                state: other.phase(),
            }),
        }
    }

    /// Generates a new key of the configured size.
    pub fn generate(&self) -> Result<KeyHandle> {
        self.with_context("generate", |ctx| {
            self.keyring.insert_with(|id| {
                KeyMaterial::generate(id, self.config.key_size, ctx.allocator(), ctx.provider())
            })
        })
    }

    /// Replaces the key behind `handle` with fresh random bytes of the same size.
    ///
    /// The old key is wiped and released before the new buffer is allocated.
    /// If generation fails the entry is left empty and later use of `handle`
    /// fails with `Error::KeyNotFound`.
    pub fn regenerate(&self, handle: &KeyHandle) -> Result<()> {
        self.with_context("regenerate", |ctx| {
            self.keyring.rebind(handle, |id, size| {
                KeyMaterial::generate(id, size, ctx.allocator(), ctx.provider())
            })
        })
    }

    /// Stores externally supplied key bytes, which must be exactly the
    /// configured key size.
    pub fn load(&self, bytes: &[u8]) -> Result<KeyHandle> {
        self.with_context("load", |ctx| {
            if bytes.len() != self.config.key_size {
                return Err(Error::InvalidKeySize {
                    expected: self.config.key_size,
                    actual: bytes.len(),
                });
            }
            self.keyring
                .insert_with(|id| KeyMaterial::load(id, bytes, self.config.key_size, ctx.allocator()))
        })
    }

    /// Wipes and releases one key and removes it from the keyring.
    pub fn destroy_key(&self, handle: &KeyHandle) -> Result<()> {
        self.with_context("destroy_key", |_| match self.keyring.remove(handle)? {
            Some(key) => key.destroy(),
            None => Ok(()),
        })
    }

    /// Gives `action` read access to the raw key bytes, e.g. to persist them.
    ///
    /// The key cannot be destroyed and shutdown cannot finish while `action`
    /// runs. `action` must not call back into this lifecycle.
    pub fn with_key_bytes<F, T>(&self, handle: &KeyHandle, action: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> T,
    {
        self.with_context("with_key_bytes", |_| Ok(()))?;
        let slot = handle.slot().read();
        let key = slot.as_ref().ok_or(Error::KeyNotFound(handle.id()))?;
        let _borrow = Borrow::enter(self.id);
        key.with_bytes(action)
    }

    /// Encrypts `input` into `output` under the key behind `handle`.
    ///
    /// A fresh base nonce is drawn from the provider for every call. Returns
    /// the number of plaintext bytes consumed.
    pub fn encrypt_stream<R, W>(&self, handle: &KeyHandle, input: &mut R, output: &mut W) -> Result<u64>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        let nonce = self.with_context("encrypt_stream", |ctx| {
            let mut nonce = [0_u8; NONCE_LEN];
            ctx.provider()
                .fill_random(&mut nonce)
                .map_err(|e| Error::Cipher(format!("Could not draw nonce: {e}")))?;
            Ok(nonce)
        })?;

        let slot = handle.slot().read();
        let key = slot.as_ref().ok_or(Error::KeyNotFound(handle.id()))?;
        let _borrow = Borrow::enter(self.id);
        stream::encrypt_stream(key, self.config.chunk_size, nonce, input, output)
    }

    /// Decrypts a stream produced by [`encrypt_stream`](Self::encrypt_stream).
    /// Returns the number of plaintext bytes written.
    pub fn decrypt_stream<R, W>(&self, handle: &KeyHandle, input: &mut R, output: &mut W) -> Result<u64>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        self.with_context("decrypt_stream", |_| Ok(()))?;

        let slot = handle.slot().read();
        let key = slot.as_ref().ok_or(Error::KeyNotFound(handle.id()))?;
        let _borrow = Borrow::enter(self.id);
        stream::decrypt_stream(key, input, output)
    }

    /// Wipes every key, releases the pool, and moves to `Terminated`.
    ///
    /// The lifecycle is `Terminated` afterwards even when a step failed; the
    /// first error is returned.
    ///
    /// The state lock is released before the keyring walk, which waits for
    /// in-flight streams and key borrows on each entry to finish.
    pub fn shutdown(&self) -> Result<()> {
        self.refuse_while_borrowed("shutdown")?;
        let mut state = self.state.write();
        let ctx = match std::mem::replace(&mut *state, State::Terminated) {
            State::Ready(ctx) => ctx,
            other => {
                let phase = other.phase();
                *state = other;
                return Err(Error::LifecycleViolation {
                    operation: "shutdown",
                    state: phase,
                });
            }
        };
        drop(state);

        let wiped = self.keyring.wipe_all();
        let torn_down = ctx.teardown();

        match (&wiped, &torn_down) {
            (Ok(count), Ok(())) => info!("Shut down after wiping {} keys", count),
            _ => error!("Shutdown completed with errors"),
        }
        wiped?;
        torn_down
    }
}

impl Drop for KeyLifecycle {
    fn drop(&mut self) {
        if self.state() != LifecycleState::Ready {
            return;
        }
        debug!("Lifecycle dropped while ready, shutting down");
        if let Err(e) = self.shutdown() {
            error!("Shutdown on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubProvider;
    use securepool::{Allocator, SecureMode};

    fn lifecycle() -> (KeyLifecycle, Arc<StubProvider>) {
        let provider = Arc::new(StubProvider::new());
        let config = Config::new().with_secure_mode(SecureMode::Disabled);
        let lc = KeyLifecycle::with_provider(config, provider.clone()).unwrap();
        (lc, provider)
    }

    #[test]
    fn test_state_display() {
        assert_eq!(LifecycleState::Uninitialized.to_string(), "uninitialized");
        assert_eq!(LifecycleState::Ready.to_string(), "ready");
        assert_eq!(LifecycleState::Terminated.to_string(), "terminated");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = KeyLifecycle::new(Config::new().with_key_size(24)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_failed_initialize_can_retry() {
        let (lc, provider) = lifecycle();
        provider.fail_pool(true);
        assert!(matches!(lc.initialize(), Err(Error::PoolAllocation(_))));
        assert_eq!(lc.state(), LifecycleState::Uninitialized);

        provider.fail_pool(false);
        lc.initialize().unwrap();
        assert_eq!(lc.state(), LifecycleState::Ready);
        lc.shutdown().unwrap();
    }

    #[test]
    fn test_drop_shuts_down() {
        let (lc, provider) = lifecycle();
        lc.initialize().unwrap();
        lc.generate().unwrap();
        drop(lc);
        assert_eq!(provider.recorder().outstanding(), 0);
        assert!(provider.recorder().is_torn_down());
    }

    #[test]
    fn test_shutdown_twice_is_violation() {
        let (lc, _) = lifecycle();
        lc.initialize().unwrap();
        lc.shutdown().unwrap();
        assert!(matches!(
            lc.shutdown(),
            Err(Error::LifecycleViolation {
                operation: "shutdown",
                state: LifecycleState::Terminated
            })
        ));
    }

    #[test]
    fn test_shutdown_before_initialize_keeps_state() {
        let (lc, _) = lifecycle();
        assert!(matches!(lc.shutdown(), Err(Error::LifecycleViolation { .. })));
        assert_eq!(lc.state(), LifecycleState::Uninitialized);
        lc.initialize().unwrap();
    }
}
