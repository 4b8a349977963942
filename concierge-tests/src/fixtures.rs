//! Test data factories for Concierge types
//!
//! Provides pre-built test data with sensible defaults.
//! Use these for quick test setup without needing to specify every field.

use chrono::{Duration, Utc};
use concierge_storage::{Guest, ServiceRequest, StaffMember};
use uuid::Uuid;

/// Default tenant used by fixtures
pub const TEST_TENANT: &str = "hotel-test";

/// Tenant fixtures
pub mod tenant {
    /// Primary tenant for isolation tests
    pub fn primary() -> &'static str {
        "hotel-alpha"
    }

    /// A different tenant, for isolation tests
    pub fn other() -> &'static str {
        "hotel-beta"
    }

    /// A unique tenant id, so parallel tests never share rows
    pub fn unique() -> String {
        format!("hotel-{}", uuid::Uuid::new_v4().simple())
    }
}

/// Guest fixture factories
pub mod guest {
    use super::*;

    /// A checked-in guest with minimal details
    pub fn simple() -> Guest {
        let now = Utc::now();
        Guest {
            id: Uuid::new_v4(),
            tenant_id: TEST_TENANT.to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            email: Some("ada@example.com".to_string()),
            phone: None,
            room_number: Some("101".to_string()),
            loyalty_tier: "standard".to_string(),
            check_in_at: Some(now - Duration::hours(2)),
            check_out_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn for_tenant(tenant_id: &str) -> Guest {
        let mut g = simple();
        g.tenant_id = tenant_id.to_string();
        g
    }

    pub fn named(first: &str, last: &str) -> Guest {
        let mut g = simple();
        g.first_name = first.to_string();
        g.last_name = last.to_string();
        g.email = Some(format!("{}.{}@example.com", first, last).to_lowercase());
        g
    }

    /// Guests in consecutive rooms, created a minute apart (useful for
    /// pagination and ordering tests)
    pub fn batch(tenant_id: &str, count: usize) -> Vec<Guest> {
        let base = Utc::now() - Duration::days(1);
        (0..count)
            .map(|i| {
                let mut g = for_tenant(tenant_id);
                g.id = Uuid::new_v4();
                g.last_name = format!("Guest{:03}", i);
                g.room_number = Some(format!("{}", 100 + i));
                g.created_at = base + Duration::minutes(i as i64);
                g.updated_at = g.created_at;
                g
            })
            .collect()
    }
}

/// Service request fixture factories
pub mod service_request {
    use super::*;

    /// An open housekeeping request
    pub fn open(guest: &Guest) -> ServiceRequest {
        let now = Utc::now();
        ServiceRequest {
            id: Uuid::new_v4(),
            tenant_id: guest.tenant_id.clone(),
            guest_id: guest.id,
            room_number: guest.room_number.clone().unwrap_or_else(|| "000".to_string()),
            category: "housekeeping".to_string(),
            description: "Fresh towels".to_string(),
            status: "open".to_string(),
            priority: 3,
            assigned_to: None,
            charge_cents: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// A request assigned to `staff`
    pub fn assigned(guest: &Guest, staff: &StaffMember) -> ServiceRequest {
        let mut r = open(guest);
        r.status = "assigned".to_string();
        r.assigned_to = Some(staff.id);
        r
    }

    /// A completed room-service order with a charge
    pub fn completed(guest: &Guest, charge_cents: i64) -> ServiceRequest {
        let mut r = open(guest);
        r.category = "room_service".to_string();
        r.description = "Club sandwich".to_string();
        r.status = "completed".to_string();
        r.charge_cents = charge_cents;
        r.completed_at = Some(Utc::now());
        r
    }

    pub fn with_priority(guest: &Guest, priority: i32) -> ServiceRequest {
        let mut r = open(guest);
        r.priority = priority;
        r
    }
}

/// Staff fixture factories
pub mod staff {
    use super::*;

    pub fn housekeeper(tenant_id: &str) -> StaffMember {
        StaffMember {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            name: "Grace Hopper".to_string(),
            role: "attendant".to_string(),
            department: "housekeeping".to_string(),
            email: None,
            active: true,
            created_at: Utc::now(),
        }
    }

    pub fn concierge(tenant_id: &str) -> StaffMember {
        let mut s = housekeeper(tenant_id);
        s.name = "Alan Turing".to_string();
        s.role = "concierge".to_string();
        s.department = "front_office".to_string();
        s
    }
}

/// A small hotel: guests, staff and their service requests for one tenant
#[derive(Debug, Clone)]
pub struct Hotel {
    pub tenant_id: String,
    pub guests: Vec<Guest>,
    pub staff: Vec<StaffMember>,
    pub requests: Vec<ServiceRequest>,
}

impl Hotel {
    /// `guests` guests, each with one open request and one completed
    /// request charged `1000 * (index + 1)` cents; the open requests are
    /// assigned to a housekeeper
    pub fn build(tenant_id: &str, guests: usize) -> Self {
        let guest_rows = guest::batch(tenant_id, guests);
        let housekeeper = staff::housekeeper(tenant_id);
        let mut requests = Vec::with_capacity(guests * 2);
        for (i, g) in guest_rows.iter().enumerate() {
            requests.push(service_request::assigned(g, &housekeeper));
            requests.push(service_request::completed(g, 1000 * (i as i64 + 1)));
        }
        Self {
            tenant_id: tenant_id.to_string(),
            guests: guest_rows,
            staff: vec![housekeeper, staff::concierge(tenant_id)],
            requests,
        }
    }

    /// Write every row into `store`
    pub fn seed(&self, store: &crate::mocks::MemoryDatastore) {
        store.seed(&self.guests);
        store.seed(&self.staff);
        store.seed(&self.requests);
    }
}
