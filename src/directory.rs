use async_trait::async_trait;
use ulid::Ulid;

/// Resolves the tenant that owns a directory entity.
///
/// Artisan and customer profiles belong to collaborators; scheduling only
/// needs their tenant to enforce isolation.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn customer_tenant(&self, customer_id: Ulid) -> Option<Ulid>;

    async fn artisan_tenant(&self, artisan_id: Ulid) -> Option<Ulid>;
}
