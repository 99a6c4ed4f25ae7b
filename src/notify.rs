use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed events, per artisan and per tenant.
/// Collaborators (payments, notifications) consume `BookingCreated` here;
/// the scheduling core never calls them directly.
pub struct NotifyHub {
    artisans: DashMap<Ulid, broadcast::Sender<Event>>,
    tenants: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            artisans: DashMap::new(),
            tenants: DashMap::new(),
        }
    }

    /// Events for a single artisan. Creates the channel if needed.
    pub fn subscribe(&self, artisan_id: Ulid) -> broadcast::Receiver<Event> {
        self.artisans
            .entry(artisan_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Every event committed within a tenant.
    pub fn subscribe_tenant(&self, tenant_id: Ulid) -> broadcast::Receiver<Event> {
        self.tenants
            .entry(tenant_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a committed event. No-op if nobody is listening.
    pub fn send(&self, tenant_id: Ulid, event: &Event) {
        if let Some(artisan_id) = event.artisan_id()
            && let Some(sender) = self.artisans.get(&artisan_id)
        {
            let _ = sender.send(event.clone());
        }
        if let Some(sender) = self.tenants.get(&tenant_id) {
            let _ = sender.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn artisan_and_tenant_subscribers_receive() {
        let hub = NotifyHub::new();
        let tenant = Ulid::new();
        let artisan = Ulid::new();
        let mut by_artisan = hub.subscribe(artisan);
        let mut by_tenant = hub.subscribe_tenant(tenant);

        let event = Event::RuleDeleted {
            id: Ulid::new(),
            artisan_id: artisan,
        };
        hub.send(tenant, &event);

        assert_eq!(by_artisan.recv().await.unwrap(), event);
        assert_eq!(by_tenant.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn other_artisans_do_not_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(Ulid::new());
        hub.send(
            Ulid::new(),
            &Event::RuleDeleted {
                id: Ulid::new(),
                artisan_id: Ulid::new(),
            },
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(
            Ulid::new(),
            &Event::CustomerRegistered {
                id: Ulid::new(),
                tenant_id: Ulid::new(),
            },
        );
    }
}
