//! Message types of the check-in domain.
//!
//! Types are dot-namespaced (`<aggregate>.<event>`). They are used purely for in-process
//! dispatch through the handler registry; the broker routing key is chosen by the
//! publisher (by convention the same string).

/// An employee checked in.
pub const CHECKIN_PERFORMED: &str = "checkin.performed";

/// An employee checked out.
pub const CHECKOUT_PERFORMED: &str = "checkout.performed";

/// An employee was created.
pub const EMPLOYEE_CREATED: &str = "employee.created";

/// An employee was updated.
pub const EMPLOYEE_UPDATED: &str = "employee.updated";

/// An employee was deleted.
pub const EMPLOYEE_DELETED: &str = "employee.deleted";

/// A role changed.
pub const ROLE_UPDATED: &str = "role.updated";

/// A permission changed.
pub const PERMISSION_UPDATED: &str = "permission.updated";

/// A tenant was provisioned.
pub const TENANT_CREATED: &str = "tenant.created";

/// Explicit request to evict cached data.
pub const CACHE_INVALIDATE: &str = "cache.invalidate";

/// Every message type the check-in service publishes.
///
/// Used at startup to validate handler registrations against typos.
pub const KNOWN: &[&str] = &[
    CHECKIN_PERFORMED,
    CHECKOUT_PERFORMED,
    EMPLOYEE_CREATED,
    EMPLOYEE_UPDATED,
    EMPLOYEE_DELETED,
    ROLE_UPDATED,
    PERMISSION_UPDATED,
    TENANT_CREATED,
    CACHE_INVALIDATE,
];

/// Map an employee action (`"created"`, `"updated"`, `"deleted"`) to its message type.
#[must_use]
pub fn employee_event(action: &str) -> Option<&'static str> {
    match action {
        "created" => Some(EMPLOYEE_CREATED),
        "updated" => Some(EMPLOYEE_UPDATED),
        "deleted" => Some(EMPLOYEE_DELETED),
        _ => None,
    }
}
