//! Process-wide wiring shared by every model.
//!
//! [`CommlogContext`] is built once from [`CommlogSettings`]: it installs
//! the log subscriber, opens storage, creates the update bus and, when
//! contacts are enabled, starts the contact cache. Models are then handed
//! out already attached to all of them.

use std::sync::Arc;

use commlog_core::logging::init_subscriber;
use commlog_settings::CommlogSettings;
use commlog_store::{SqliteGateway, StorageGateway};
use tracing::info;

use crate::bridge::UpdateBus;
use crate::contacts::{ContactCache, ContactResolver};
use crate::errors::Result;
use crate::model::EventModel;

/// Shared services for the models of one process.
pub struct CommlogContext {
    settings: CommlogSettings,
    gateway: Arc<dyn StorageGateway>,
    bus: UpdateBus,
    contacts: Option<Arc<ContactCache>>,
}

impl std::fmt::Debug for CommlogContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommlogContext")
            .field("database", &self.settings.database.path)
            .field("contacts", &self.contacts.is_some())
            .finish_non_exhaustive()
    }
}

impl CommlogContext {
    /// Open the database named in `settings`.
    ///
    /// `resolver` is only used when `contacts.enabled` is set; the contact
    /// cache then needs a running tokio runtime.
    pub fn open(
        settings: CommlogSettings,
        resolver: Option<Arc<dyn ContactResolver>>,
    ) -> Result<Self> {
        init_subscriber(&settings.logging.level);
        let gateway: Arc<dyn StorageGateway> = Arc::new(SqliteGateway::open(&settings.database)?);
        info!(path = %settings.database.path, "event database open");
        Self::with_gateway(settings, gateway, resolver)
    }

    /// Like [`open`](Self::open) over an existing gateway. Does not touch
    /// logging.
    pub fn with_gateway(
        settings: CommlogSettings,
        gateway: Arc<dyn StorageGateway>,
        resolver: Option<Arc<dyn ContactResolver>>,
    ) -> Result<Self> {
        let contacts = match resolver {
            Some(resolver) if settings.contacts.enabled => {
                Some(ContactCache::start(resolver, &settings.contacts)?)
            }
            _ => None,
        };
        Ok(Self {
            bus: UpdateBus::from_settings(&settings.bus),
            settings,
            gateway,
            contacts,
        })
    }

    /// A new model using the configured query mode, attached to the bus
    /// and, if running, the contact cache.
    pub fn model(&self) -> Result<EventModel> {
        let mut model = EventModel::from_settings(Arc::clone(&self.gateway), &self.settings.query)?
            .with_bus(&self.bus);
        if let Some(contacts) = &self.contacts {
            model = model.with_contacts(Arc::clone(contacts));
        }
        Ok(model)
    }

    /// Settings the context was built from.
    pub fn settings(&self) -> &CommlogSettings {
        &self.settings
    }

    /// Shared storage.
    pub fn gateway(&self) -> &Arc<dyn StorageGateway> {
        &self.gateway
    }

    /// The contact cache, when contacts are enabled.
    pub fn contacts(&self) -> Option<&Arc<ContactCache>> {
        self.contacts.as_ref()
    }
}
