//! Master key migration
//!
//! Moves a user onto a new master key (a custody change such as Local to
//! VetKey, or a password rotation):
//!
//! 1. the active key must be opened;
//! 2. an ECDH key's secret is reused as the new key material, anything else
//!    gets fresh material;
//! 3. the new key is appended, older keys are kept;
//! 4. every channel KEK still wrapped under an older key is re-wrapped under
//!    the new one;
//! 5. the static ECDH key is re-wrapped;
//! 6. the new key's record is published for other devices.
//!
//! Steps 4 to 6 are best-effort. A failed channel stays readable through the
//! retained older key, and anything left over is picked up by the next
//! [`KeySession::resume_migration`]. After a restart an older key of another
//! kind than the new one must be reopened with
//! [`KeySession::open_previous_master_keys`] (or opens by itself through
//! [`KeySession::try_open_master_key`] while its password is cached) before
//! a resume can finish.

use dmsg_crypto::KEY_SIZE;
use zeroize::Zeroizing;

use super::{Install, KeySession, static_key::Recovered};
use crate::{
    channel_key::{CHANNEL_KEY_AAD, open_channel_kek},
    directory::ChannelDirectory,
    env::Environment,
    error::KeyError,
    event::KeyEvent,
    id::ChannelId,
    master_key::MasterKeyKind,
    store::{CustodialStore, LocalKeyStore},
};

/// Custody mode to migrate to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationTarget<'a> {
    /// Password plus device IV
    Local {
        /// New password
        password: &'a str,
    },
    /// Password plus custodian secret
    Ecdh {
        /// New password
        password: &'a str,
    },
    /// Threshold-derived key
    VetKey,
}

impl MigrationTarget<'_> {
    /// Master key kind of the target.
    pub fn kind(&self) -> MasterKeyKind {
        match self {
            Self::Local { .. } => MasterKeyKind::Local,
            Self::Ecdh { .. } => MasterKeyKind::Ecdh,
            Self::VetKey => MasterKeyKind::VetKey,
        }
    }

    fn password(&self) -> &str {
        match self {
            Self::Local { password } | Self::Ecdh { password } => password,
            Self::VetKey => "",
        }
    }
}

/// Per-channel outcome of a migration pass.
#[derive(Debug, Default)]
pub struct MigrationReport {
    /// Channels re-wrapped under the active key in this pass
    pub migrated: Vec<ChannelId>,
    /// Channels already wrapped under the active key
    pub already_current: Vec<ChannelId>,
    /// Channels left under an older key, with the reason
    pub failed: Vec<(ChannelId, KeyError)>,
    /// Whether the static key is wrapped under the active key
    pub static_key_current: bool,
    /// Whether other devices can adopt the active key record
    pub master_key_published: bool,
}

impl MigrationReport {
    /// Nothing is left under an older key.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.static_key_current && self.master_key_published
    }
}

enum ChannelMigration {
    Migrated,
    AlreadyCurrent,
}

impl<E: Environment, S: CustodialStore, L: LocalKeyStore> KeySession<E, S, L> {
    /// Append a new master key of the target kind and re-wrap everything
    /// under it.
    ///
    /// # Errors
    ///
    /// - `NotReady`: active master key not opened
    ///
    /// Once the new key is installed the call only fails if the channel list
    /// cannot be fetched. Everything else left undone is listed in the report.
    pub async fn migrate_master_key<D: ChannelDirectory>(
        &mut self,
        directory: &D,
        target: MigrationTarget<'_>,
    ) -> Result<MigrationReport, KeyError> {
        let active = self.ready_master_key()?;
        let from = active.kind();
        let material = Zeroizing::new(match from {
            MasterKeyKind::Ecdh => *active.key()?.as_bytes(),
            MasterKeyKind::Local | MasterKeyKind::VetKey => self.env.random_array::<KEY_SIZE>(),
        });

        let to = target.kind();
        let key = self.new_master_key(to, target.password(), *material, Install::Migrate).await?;
        self.master_keys.push(key);
        self.persist_master_keys()?;

        let version = self.master_keys.active().map_or(0, |key| key.version());
        tracing::info!(principal = %self.principal, %from, %to, version, "master key migrated");
        self.emit(KeyEvent::MasterKeyOpened { kind: to, version });

        self.resume_migration(directory).await
    }

    /// Re-wrap every channel KEK and the static key still under an older
    /// master key, and publish the active key record. Safe to run
    /// repeatedly.
    pub async fn resume_migration<D: ChannelDirectory>(
        &mut self,
        directory: &D,
    ) -> Result<MigrationReport, KeyError> {
        self.ready_master_key()?;
        let channels = directory.my_channels(&self.principal).await?;

        let mut report = MigrationReport::default();
        for channel in channels {
            match self.migrate_channel(&channel).await {
                Ok(ChannelMigration::Migrated) => report.migrated.push(channel),
                Ok(ChannelMigration::AlreadyCurrent) => report.already_current.push(channel),
                Err(err) => {
                    tracing::warn!(channel = %channel, error = %err, "channel KEK not migrated");
                    report.failed.push((channel, err));
                },
            }
        }

        report.static_key_current = match self.migrate_static_key().await {
            Ok(current) => current,
            Err(err) => {
                tracing::warn!(principal = %self.principal, error = %err, "static key not migrated");
                false
            },
        };

        report.master_key_published = match self.publish_master_key().await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(principal = %self.principal, error = %err, "master key record not published");
                false
            },
        };

        tracing::info!(
            principal = %self.principal,
            migrated = report.migrated.len(),
            already_current = report.already_current.len(),
            failed = report.failed.len(),
            "migration pass finished"
        );
        self.emit(KeyEvent::MigrationCompleted {
            migrated: report.migrated.len(),
            failed: report.failed.len(),
        });
        Ok(report)
    }

    async fn migrate_channel(&self, channel: &ChannelId) -> Result<ChannelMigration, KeyError> {
        let active = self.ready_master_key()?;
        let encrypted = self.load_channel_kek(channel).await?;

        if active.decrypt(&encrypted, CHANNEL_KEY_AAD).is_ok() {
            return Ok(ChannelMigration::AlreadyCurrent);
        }

        let kek = open_channel_kek(self.master_keys.opened_newest_first().skip(1), &encrypted)
            .map_err(|err| {
                if self.master_keys.closed_older().next().is_some() {
                    KeyError::PREVIOUS_MASTER_KEY_NOT_READY
                } else {
                    err
                }
            })?;
        let rewrapped = active.encrypt(kek.as_bytes(), CHANNEL_KEY_AAD, self.env.random_array())?;
        self.save_channel_kek(channel, &rewrapped).await?;

        tracing::debug!(channel = %channel, "channel KEK migrated");
        Ok(ChannelMigration::Migrated)
    }

    /// Re-wrap the stored static key. Returns whether it ends up under the
    /// active key; a missing key is not created here.
    async fn migrate_static_key(&mut self) -> Result<bool, KeyError> {
        match self.recover_static_key().await? {
            Recovered::Current(pair) => {
                self.static_key = Some(pair);
                Ok(true)
            },
            Recovered::Previous(pair) => {
                self.save_static_key(&pair).await?;
                self.static_key = Some(pair);
                tracing::info!(principal = %self.principal, "static key re-wrapped under active master key");
                Ok(true)
            },
            Recovered::Missing => Ok(false),
        }
    }
}
