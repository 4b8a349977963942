//! Database models for Concierge guest-service data

use crate::entity::{Column, ColumnRef, Entity, Relation, RelationKind, SqlType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hotel guest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guest {
    pub id: Uuid,
    pub tenant_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub room_number: Option<String>,
    pub loyalty_tier: String,
    pub check_in_at: Option<DateTime<Utc>>,
    pub check_out_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestColumn {
    Id,
    TenantId,
    FirstName,
    LastName,
    Email,
    Phone,
    RoomNumber,
    LoyaltyTier,
    CheckInAt,
    CheckOutAt,
    CreatedAt,
    UpdatedAt,
}

impl Column for GuestColumn {
    fn name(self) -> &'static str {
        match self {
            GuestColumn::Id => "id",
            GuestColumn::TenantId => "tenant_id",
            GuestColumn::FirstName => "first_name",
            GuestColumn::LastName => "last_name",
            GuestColumn::Email => "email",
            GuestColumn::Phone => "phone",
            GuestColumn::RoomNumber => "room_number",
            GuestColumn::LoyaltyTier => "loyalty_tier",
            GuestColumn::CheckInAt => "check_in_at",
            GuestColumn::CheckOutAt => "check_out_at",
            GuestColumn::CreatedAt => "created_at",
            GuestColumn::UpdatedAt => "updated_at",
        }
    }

    fn sql_type(self) -> SqlType {
        match self {
            GuestColumn::Id => SqlType::Uuid,
            GuestColumn::CheckInAt
            | GuestColumn::CheckOutAt
            | GuestColumn::CreatedAt
            | GuestColumn::UpdatedAt => SqlType::Timestamp,
            _ => SqlType::Text,
        }
    }
}

const GUEST_COLUMNS: &[ColumnRef] = &[
    ColumnRef::new("id", SqlType::Uuid),
    ColumnRef::new("tenant_id", SqlType::Text),
    ColumnRef::new("first_name", SqlType::Text),
    ColumnRef::new("last_name", SqlType::Text),
    ColumnRef::new("room_number", SqlType::Text),
    ColumnRef::new("loyalty_tier", SqlType::Text),
];

impl Entity for Guest {
    type Column = GuestColumn;

    const TABLE: &'static str = "guests";
    const TENANT_COLUMN: GuestColumn = GuestColumn::TenantId;
    const PRIMARY_KEY: GuestColumn = GuestColumn::Id;

    fn columns() -> &'static [GuestColumn] {
        use GuestColumn::*;
        &[
            Id,
            TenantId,
            FirstName,
            LastName,
            Email,
            Phone,
            RoomNumber,
            LoyaltyTier,
            CheckInAt,
            CheckOutAt,
            CreatedAt,
            UpdatedAt,
        ]
    }

    // Contact details (email, phone) are only returned when selected explicitly.
    fn default_projection() -> &'static [GuestColumn] {
        use GuestColumn::*;
        &[
            Id,
            TenantId,
            FirstName,
            LastName,
            RoomNumber,
            LoyaltyTier,
            CheckInAt,
            CheckOutAt,
        ]
    }

    fn relations() -> &'static [Relation] {
        const RELATIONS: &[Relation] = &[Relation {
            name: "service_requests",
            kind: RelationKind::HasMany,
            local_column: ColumnRef::new("id", SqlType::Uuid),
            table: "service_requests",
            foreign_column: ColumnRef::new("guest_id", SqlType::Uuid),
            tenant_column: ColumnRef::new("tenant_id", SqlType::Text),
            columns: SERVICE_REQUEST_SUMMARY_COLUMNS,
        }];
        RELATIONS
    }
}

/// Guest-service request (housekeeping, room service, maintenance, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub id: Uuid,
    pub tenant_id: String,
    pub guest_id: Uuid,
    pub room_number: String,
    pub category: String,
    pub description: String,
    pub status: String,
    pub priority: i32,
    pub assigned_to: Option<Uuid>,
    pub charge_cents: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceRequestColumn {
    Id,
    TenantId,
    GuestId,
    RoomNumber,
    Category,
    Description,
    Status,
    Priority,
    AssignedTo,
    ChargeCents,
    CreatedAt,
    UpdatedAt,
    CompletedAt,
}

impl Column for ServiceRequestColumn {
    fn name(self) -> &'static str {
        match self {
            ServiceRequestColumn::Id => "id",
            ServiceRequestColumn::TenantId => "tenant_id",
            ServiceRequestColumn::GuestId => "guest_id",
            ServiceRequestColumn::RoomNumber => "room_number",
            ServiceRequestColumn::Category => "category",
            ServiceRequestColumn::Description => "description",
            ServiceRequestColumn::Status => "status",
            ServiceRequestColumn::Priority => "priority",
            ServiceRequestColumn::AssignedTo => "assigned_to",
            ServiceRequestColumn::ChargeCents => "charge_cents",
            ServiceRequestColumn::CreatedAt => "created_at",
            ServiceRequestColumn::UpdatedAt => "updated_at",
            ServiceRequestColumn::CompletedAt => "completed_at",
        }
    }

    fn sql_type(self) -> SqlType {
        match self {
            ServiceRequestColumn::Id
            | ServiceRequestColumn::GuestId
            | ServiceRequestColumn::AssignedTo => SqlType::Uuid,
            ServiceRequestColumn::Priority => SqlType::Integer,
            ServiceRequestColumn::ChargeCents => SqlType::BigInt,
            ServiceRequestColumn::CreatedAt
            | ServiceRequestColumn::UpdatedAt
            | ServiceRequestColumn::CompletedAt => SqlType::Timestamp,
            _ => SqlType::Text,
        }
    }
}

const SERVICE_REQUEST_SUMMARY_COLUMNS: &[ColumnRef] = &[
    ColumnRef::new("id", SqlType::Uuid),
    ColumnRef::new("tenant_id", SqlType::Text),
    ColumnRef::new("guest_id", SqlType::Uuid),
    ColumnRef::new("category", SqlType::Text),
    ColumnRef::new("status", SqlType::Text),
    ColumnRef::new("priority", SqlType::Integer),
    ColumnRef::new("created_at", SqlType::Timestamp),
];

const STAFF_COLUMNS: &[ColumnRef] = &[
    ColumnRef::new("id", SqlType::Uuid),
    ColumnRef::new("tenant_id", SqlType::Text),
    ColumnRef::new("name", SqlType::Text),
    ColumnRef::new("role", SqlType::Text),
    ColumnRef::new("department", SqlType::Text),
];

impl Entity for ServiceRequest {
    type Column = ServiceRequestColumn;

    const TABLE: &'static str = "service_requests";
    const TENANT_COLUMN: ServiceRequestColumn = ServiceRequestColumn::TenantId;
    const PRIMARY_KEY: ServiceRequestColumn = ServiceRequestColumn::Id;

    fn columns() -> &'static [ServiceRequestColumn] {
        use ServiceRequestColumn::*;
        &[
            Id,
            TenantId,
            GuestId,
            RoomNumber,
            Category,
            Description,
            Status,
            Priority,
            AssignedTo,
            ChargeCents,
            CreatedAt,
            UpdatedAt,
            CompletedAt,
        ]
    }

    fn default_projection() -> &'static [ServiceRequestColumn] {
        use ServiceRequestColumn::*;
        &[
            Id,
            TenantId,
            GuestId,
            RoomNumber,
            Category,
            Status,
            Priority,
            AssignedTo,
            CreatedAt,
            UpdatedAt,
        ]
    }

    fn relations() -> &'static [Relation] {
        const RELATIONS: &[Relation] = &[
            Relation {
                name: "guest",
                kind: RelationKind::BelongsTo,
                local_column: ColumnRef::new("guest_id", SqlType::Uuid),
                table: "guests",
                foreign_column: ColumnRef::new("id", SqlType::Uuid),
                tenant_column: ColumnRef::new("tenant_id", SqlType::Text),
                columns: GUEST_COLUMNS,
            },
            Relation {
                name: "assignee",
                kind: RelationKind::BelongsTo,
                local_column: ColumnRef::new("assigned_to", SqlType::Uuid),
                table: "staff_members",
                foreign_column: ColumnRef::new("id", SqlType::Uuid),
                tenant_column: ColumnRef::new("tenant_id", SqlType::Text),
                columns: STAFF_COLUMNS,
            },
        ];
        RELATIONS
    }
}

/// Hotel staff member who can be assigned service requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub role: String,
    pub department: String,
    pub email: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StaffMemberColumn {
    Id,
    TenantId,
    Name,
    Role,
    Department,
    Email,
    Active,
    CreatedAt,
}

impl Column for StaffMemberColumn {
    fn name(self) -> &'static str {
        match self {
            StaffMemberColumn::Id => "id",
            StaffMemberColumn::TenantId => "tenant_id",
            StaffMemberColumn::Name => "name",
            StaffMemberColumn::Role => "role",
            StaffMemberColumn::Department => "department",
            StaffMemberColumn::Email => "email",
            StaffMemberColumn::Active => "active",
            StaffMemberColumn::CreatedAt => "created_at",
        }
    }

    fn sql_type(self) -> SqlType {
        match self {
            StaffMemberColumn::Id => SqlType::Uuid,
            StaffMemberColumn::Active => SqlType::Boolean,
            StaffMemberColumn::CreatedAt => SqlType::Timestamp,
            _ => SqlType::Text,
        }
    }
}

impl Entity for StaffMember {
    type Column = StaffMemberColumn;

    const TABLE: &'static str = "staff_members";
    const TENANT_COLUMN: StaffMemberColumn = StaffMemberColumn::TenantId;
    const PRIMARY_KEY: StaffMemberColumn = StaffMemberColumn::Id;

    fn columns() -> &'static [StaffMemberColumn] {
        use StaffMemberColumn::*;
        &[Id, TenantId, Name, Role, Department, Email, Active, CreatedAt]
    }

    fn default_projection() -> &'static [StaffMemberColumn] {
        use StaffMemberColumn::*;
        &[Id, TenantId, Name, Role, Department, Active]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_projection_includes_tenant_column() {
        assert!(Guest::default_projection().contains(&Guest::TENANT_COLUMN));
        assert!(ServiceRequest::default_projection().contains(&ServiceRequest::TENANT_COLUMN));
        assert!(StaffMember::default_projection().contains(&StaffMember::TENANT_COLUMN));
    }

    #[test]
    fn test_guest_contact_details_not_in_default_projection() {
        let projection = Guest::default_projection();
        assert!(!projection.contains(&GuestColumn::Email));
        assert!(!projection.contains(&GuestColumn::Phone));
    }

    #[test]
    fn test_relation_lookup() {
        let guest = ServiceRequest::relation("guest").expect("guest relation");
        assert_eq!(guest.table, "guests");
        assert_eq!(guest.kind, RelationKind::BelongsTo);
        assert!(ServiceRequest::relation("invoices").is_none());
        assert_eq!(
            Guest::relation("service_requests").map(|r| r.kind),
            Some(RelationKind::HasMany)
        );
    }

    #[test]
    fn test_column_by_name() {
        assert_eq!(
            ServiceRequest::column_by_name("status"),
            Some(ServiceRequestColumn::Status)
        );
        assert_eq!(ServiceRequest::column_by_name("password"), None);
        assert_eq!(ServiceRequestColumn::Priority.sql_type(), SqlType::Integer);
    }
}
