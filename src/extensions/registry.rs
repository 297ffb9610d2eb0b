//! Extension registry - manifests and live connection state.
//!
//! The registry is owned by the host control loop and mutated only from
//! there, so it carries no locking of its own.

use std::collections::HashMap;

use serde::Serialize;

use super::error::{ExtensionError, ExtensionResult};
use super::manifest::ExtensionManifest;
use super::ExtensionId;

/// Lifecycle state of an extension's process/connection pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    /// Process spawned, handshake pending.
    Starting,
    /// Handshake completed; queries can be sent.
    Connected,
    /// Process exited unexpectedly; a restart may be pending.
    Crashed,
    /// Not running, by request (or never started).
    Stopped,
    /// Crashed too often. Terminal until an explicit reload.
    Disabled,
}

impl ConnectionState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `Disabled -> Starting` is deliberately absent: leaving `Disabled`
    /// goes through [`ExtensionRegistry::reenable`].
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Starting, Connected)
                | (Starting, Crashed)
                | (Starting, Stopped)
                | (Connected, Stopped)
                | (Connected, Crashed)
                | (Crashed, Starting)
                | (Crashed, Disabled)
                | (Crashed, Stopped)
                | (Stopped, Starting)
        )
    }
}

/// A registered extension.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub manifest: ExtensionManifest,
    pub state: ConnectionState,
}

/// Mapping from extension id to manifest and connection state.
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    /// Declaration order of extension ids.
    order: Vec<ExtensionId>,
    entries: HashMap<ExtensionId, RegistryEntry>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from manifests in declaration order.
    pub fn from_manifests(manifests: Vec<ExtensionManifest>) -> ExtensionResult<Self> {
        let mut registry = Self::new();
        for manifest in manifests {
            registry.insert(manifest)?;
        }
        Ok(registry)
    }

    /// Register a new extension in the `Stopped` state.
    pub fn insert(&mut self, manifest: ExtensionManifest) -> ExtensionResult<()> {
        if self.entries.contains_key(&manifest.id) {
            return Err(ExtensionError::DuplicateId(manifest.id));
        }
        manifest.validate()?;

        self.order.push(manifest.id.clone());
        self.entries.insert(
            manifest.id.clone(),
            RegistryEntry {
                manifest,
                state: ConnectionState::Stopped,
            },
        );
        Ok(())
    }

    /// Replace an extension's manifest wholesale, keeping its state and
    /// declaration position. Returns the previous manifest.
    pub fn replace_manifest(
        &mut self,
        manifest: ExtensionManifest,
    ) -> ExtensionResult<ExtensionManifest> {
        manifest.validate()?;
        let entry = self
            .entries
            .get_mut(&manifest.id)
            .ok_or_else(|| ExtensionError::ExtensionNotFound(manifest.id.clone()))?;
        Ok(std::mem::replace(&mut entry.manifest, manifest))
    }

    /// Forget an extension entirely.
    pub fn remove(&mut self, id: &str) -> Option<RegistryEntry> {
        self.order.retain(|existing| existing != id);
        self.entries.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&RegistryEntry> {
        self.entries.get(id)
    }

    pub fn manifest(&self, id: &str) -> Option<&ExtensionManifest> {
        self.entries.get(id).map(|entry| &entry.manifest)
    }

    pub fn state(&self, id: &str) -> Option<ConnectionState> {
        self.entries.get(id).map(|entry| entry.state)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Extension ids in declaration order.
    pub fn ids(&self) -> &[ExtensionId] {
        &self.order
    }

    /// Entries in declaration order.
    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    /// Current state of every extension, in declaration order.
    pub fn snapshot(&self) -> Vec<(ExtensionId, ConnectionState)> {
        self.entries()
            .map(|entry| (entry.manifest.id.clone(), entry.state))
            .collect()
    }

    /// Move an extension to `next`, enforcing the lifecycle.
    pub fn transition(
        &mut self,
        id: &str,
        next: ConnectionState,
    ) -> ExtensionResult<ConnectionState> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| ExtensionError::ExtensionNotFound(id.to_string()))?;

        let previous = entry.state;
        if !previous.can_transition_to(next) {
            return Err(ExtensionError::InvalidTransition {
                id: id.to_string(),
                from: previous,
                to: next,
            });
        }

        entry.state = next;
        Ok(previous)
    }

    /// Leave `Disabled` (or any idle state) after an explicit reload.
    pub fn reenable(&mut self, id: &str) -> ExtensionResult<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| ExtensionError::ExtensionNotFound(id.to_string()))?;

        match entry.state {
            ConnectionState::Disabled | ConnectionState::Crashed | ConnectionState::Stopped => {
                entry.state = ConnectionState::Stopped;
                Ok(())
            }
            other => Err(ExtensionError::InvalidTransition {
                id: id.to_string(),
                from: other,
                to: ConnectionState::Stopped,
            }),
        }
    }

    /// Extensions claiming `token`, in declaration order.
    ///
    /// A trigger matches when it equals `token`, or when `token` starts with
    /// the trigger followed by whitespace. Matching is case-sensitive.
    pub fn find_by_keyword(&self, token: &str) -> Vec<ExtensionId> {
        self.entries()
            .filter(|entry| {
                entry
                    .manifest
                    .triggers
                    .iter()
                    .any(|trigger| trigger_matches(trigger, token))
            })
            .map(|entry| entry.manifest.id.clone())
            .collect()
    }
}

fn trigger_matches(trigger: &str, token: &str) -> bool {
    match token.strip_prefix(trigger) {
        Some(rest) => rest.is_empty() || rest.starts_with(char::is_whitespace),
        None => false,
    }
}
