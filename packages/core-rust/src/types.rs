use uuid::Uuid;

/// An entity tagged with its owner.
///
/// Entities hold explicit `id` and `tenant_id` fields and expose them through
/// this trait, so event handlers can key idempotent processing and tenant
/// scoping on the same pair regardless of the concrete type.
pub trait Owned {
    /// Identifier of the record itself.
    fn id(&self) -> Uuid;

    /// Identifier of the tenant (customer) that owns the record.
    fn tenant_id(&self) -> Uuid;
}
