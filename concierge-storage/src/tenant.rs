//! Multi-tenancy support

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;
use uuid::Uuid;

/// Tenant identifier for multi-tenant isolation
///
/// In Concierge a tenant is a hotel property; rows of one property must never
/// be visible to queries scoped to another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    /// Create a new tenant ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the tenant ID as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Proof that a caller was explicitly granted cross-tenant access.
///
/// The only constructor is [`Elevated::grant`], which logs the grant so
/// privileged reads and writes leave an audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elevated {
    reason: String,
}

impl Elevated {
    /// Grant cross-tenant access for the given reason
    pub fn grant(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!(reason = %reason, "Cross-tenant data access granted");
        Self { reason }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Tenant scope applied to every repository statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantScope {
    /// Rows are restricted to a single tenant
    Tenant(TenantId),
    /// Rows of every tenant are visible (privileged callers only)
    CrossTenant(Elevated),
}

impl TenantScope {
    /// Scope to a single tenant
    pub fn tenant(id: impl Into<TenantId>) -> Self {
        Self::Tenant(id.into())
    }

    /// Cross-tenant scope, granted and logged on construction
    pub fn elevated(reason: impl Into<String>) -> Self {
        Self::CrossTenant(Elevated::grant(reason))
    }

    pub fn tenant_id(&self) -> Option<&TenantId> {
        match self {
            Self::Tenant(id) => Some(id),
            Self::CrossTenant(_) => None,
        }
    }

    pub fn is_elevated(&self) -> bool {
        matches!(self, Self::CrossTenant(_))
    }
}

impl fmt::Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tenant(id) => write!(f, "{}", id),
            Self::CrossTenant(_) => f.write_str("*"),
        }
    }
}

/// Context propagated alongside every operation for logging, error
/// classification and audit. Never consulted for authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    pub operation: String,
    pub tenant_id: Option<TenantId>,
    pub user_id: Option<String>,
    pub trace_id: String,
}

impl OperationContext {
    /// Create a context with a fresh trace id
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            tenant_id: None,
            user_id: None,
            trace_id: Uuid::new_v4().to_string(),
        }
    }

    /// Create a context for an operation running under a tenant scope
    pub fn for_scope(operation: impl Into<String>, scope: &TenantScope) -> Self {
        let mut ctx = Self::new(operation);
        ctx.tenant_id = scope.tenant_id().cloned();
        ctx
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<TenantId>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Tenant id for log fields ("-" when absent)
    pub fn tenant_label(&self) -> &str {
        self.tenant_id.as_ref().map(|t| t.as_str()).unwrap_or("-")
    }
}
