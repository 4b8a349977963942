//! Pagination tests for the repository and query builder

use concierge_storage::models::GuestColumn;
use concierge_storage::query::SelectQuery;
use concierge_storage::{Filter, Guest, PageRequest, SortOrder, TenantScope};
use concierge_tests::assertions::{assert_sorted_by, assert_validation_error, PageAssertions};
use concierge_tests::{guest, tenant, TestLayer, TestLayerBuilder};
use serde::Deserialize;
use std::collections::HashSet;
use uuid::Uuid;

async fn hotel_with_guests(count: usize) -> (TestLayer, TenantScope) {
    let test = TestLayerBuilder::new().build().await.unwrap();
    let tenant_id = tenant::unique();
    test.store.seed(&guest::batch(&tenant_id, count));
    // Noise from another tenant must never show up in totals
    test.store.seed(&guest::batch(tenant::other(), 4));
    (test, TenantScope::tenant(tenant_id))
}

#[tokio::test]
async fn first_middle_and_last_pages() {
    let (test, scope) = hotel_with_guests(25).await;
    let guests = test.repository::<Guest>();
    let query = || SelectQuery::new().order_by(GuestColumn::LastName, SortOrder::Asc);

    let first = guests
        .find_many_paginated(&scope, query(), PageRequest::new(1, 10))
        .await
        .unwrap();
    PageAssertions::new(&first)
        .assert_len(10)
        .assert_total(25, 3)
        .assert_navigation(false, true);

    let middle = guests
        .find_many_paginated(&scope, query(), PageRequest::new(2, 10))
        .await
        .unwrap();
    PageAssertions::new(&middle)
        .assert_len(10)
        .assert_navigation(true, true);

    let last = guests
        .find_many_paginated(&scope, query(), PageRequest::new(3, 10))
        .await
        .unwrap();
    PageAssertions::new(&last)
        .assert_len(5)
        .assert_total(25, 3)
        .assert_navigation(true, false);
}

#[tokio::test]
async fn pages_partition_the_result_set_in_order() {
    let (test, scope) = hotel_with_guests(23).await;
    let mut all = Vec::new();
    for page in 1..=3 {
        let result = test
            .repository::<Guest>()
            .query()
            .tenant_scope(scope.clone())
            .order_by(GuestColumn::LastName, SortOrder::Asc)
            .paginate(page, 10)
            .await
            .unwrap();
        all.extend(result.data);
    }

    assert_eq!(all.len(), 23);
    assert_sorted_by(&all, "last_name", SortOrder::Asc);
    let ids: HashSet<String> = all.iter().map(|r| r["id"].to_string()).collect();
    assert_eq!(ids.len(), 23, "pages overlap");
}

#[tokio::test]
async fn page_past_the_end_is_empty() {
    let (test, scope) = hotel_with_guests(5).await;
    let page = test
        .repository::<Guest>()
        .find_many_paginated(&scope, SelectQuery::new(), PageRequest::new(4, 2))
        .await
        .unwrap();

    PageAssertions::new(&page)
        .assert_len(0)
        .assert_total(5, 3)
        .assert_navigation(true, false);
}

#[tokio::test]
async fn total_respects_filter() {
    let (test, scope) = hotel_with_guests(12).await;
    let page = test
        .repository::<Guest>()
        .query()
        .tenant_scope(scope)
        .filter(Filter::starts_with(GuestColumn::LastName, "Guest00"))
        .paginate(1, 5)
        .await
        .unwrap();

    // Guest000 through Guest009
    PageAssertions::new(&page)
        .assert_len(5)
        .assert_total(10, 2)
        .assert_navigation(false, true);
}

#[tokio::test]
async fn invalid_page_requests_are_rejected() {
    let (test, scope) = hotel_with_guests(1).await;
    let guests = test.repository::<Guest>();

    for request in [
        PageRequest::new(0, 10),
        PageRequest::new(1, 0),
        PageRequest::new(1, 101),
    ] {
        let err = guests
            .find_many_paginated(&scope, SelectQuery::new(), request)
            .await
            .unwrap_err();
        assert_validation_error(&err);
    }
    assert!(test.store.statements_for("guests").is_empty());
}

#[tokio::test]
async fn pagination_serializes_camel_case() {
    let (test, scope) = hotel_with_guests(3).await;
    let page = test
        .repository::<Guest>()
        .find_many_paginated(&scope, SelectQuery::new(), PageRequest::new(1, 2))
        .await
        .unwrap();

    let json = serde_json::to_value(page.pagination).unwrap();
    assert_eq!(json["totalPages"], 2);
    assert_eq!(json["hasNext"], true);
    assert_eq!(json["hasPrev"], false);
}

#[derive(Debug, Deserialize)]
struct RoomListing {
    id: Uuid,
    last_name: String,
    room_number: Option<String>,
}

#[tokio::test]
async fn page_decodes_into_projection() {
    let (test, scope) = hotel_with_guests(4).await;
    let page = test
        .repository::<Guest>()
        .query()
        .tenant_scope(scope)
        .select([GuestColumn::Id, GuestColumn::LastName, GuestColumn::RoomNumber])
        .order_by(GuestColumn::RoomNumber, SortOrder::Desc)
        .paginate(1, 3)
        .await
        .unwrap()
        .decode::<RoomListing>()
        .unwrap();

    assert_eq!(page.data.len(), 3);
    assert_eq!(page.data[0].room_number.as_deref(), Some("103"));
    assert_eq!(page.data[0].last_name, "Guest003");
    assert!(!page.data[0].id.is_nil());
    assert_eq!(page.pagination.total, 4);
}
