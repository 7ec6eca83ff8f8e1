mod support;

use http::StatusCode;
use pretty_assertions::assert_eq;
use report_query::auth::Role;
use serde_json::{json, Value};
use std::time::Duration;
use support::{read_json, with_report_harness, DIRECTORY_FAILURE};

fn inactive_users(days: Value) -> Value {
    json!({ "queryId": "inactive_users", "parameters": { "days": days } })
}

#[tokio::test]
async fn inactive_users_runs_against_the_directory() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);
        let response = harness
            .post("/api/query/execute", Some(&token), &inactive_users(json!(90)))
            .await;
        let (status, body) = read_json(response).await;

        assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["metadata"]["dataSource"], json!("ad"));
        assert_eq!(body["metadata"]["queryId"], json!("inactive_users"));
        assert_eq!(body["data"]["dataSource"], json!("ad"));
        assert_eq!(body["data"]["rowCount"], json!(2));
        assert_eq!(body["data"]["cached"], json!(false));

        let rows = body["data"]["rows"].as_array().expect("rows should be an array");
        assert_eq!(rows[0]["username"], json!("jdoe"));
        assert_eq!(rows[0]["department"], json!("Finance"));
        assert_eq!(rows[1]["username"], json!("alee"));
        assert_eq!(rows[1]["email"], Value::Null);

        let ldap = harness
            .calls
            .last_ldap
            .lock()
            .clone()
            .expect("directory should have been searched");
        assert!(ldap.filter.contains("lastLogonTimestamp<="), "filter: {}", ldap.filter);
        assert!(!ldap.filter.contains("{{"), "unrendered filter: {}", ldap.filter);
    })
    .await;
}

#[tokio::test]
async fn repeated_execution_is_served_from_cache() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);
        let request = inactive_users(json!(30));

        let (_, first) = read_json(harness.post("/api/query/execute", Some(&token), &request).await).await;
        let (status, second) =
            read_json(harness.post("/api/query/execute", Some(&token), &request).await).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["data"]["cached"], json!(false));
        assert_eq!(second["data"]["cached"], json!(true));
        assert_eq!(first["data"]["rows"], second["data"]["rows"]);
        assert_eq!(harness.calls.ldap(), 1);

        let (_, other_days) = read_json(
            harness
                .post("/api/query/execute", Some(&token), &inactive_users(json!(31)))
                .await,
        )
        .await;
        assert_eq!(other_days["data"]["cached"], json!(false));
        assert_eq!(harness.calls.ldap(), 2);
    })
    .await;
}

#[tokio::test]
async fn skip_cache_refetches_and_refreshes_the_entry() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);
        let request = inactive_users(json!(90));
        let mut skipping = request.clone();
        skipping["options"] = json!({ "skipCache": true });

        harness.post("/api/query/execute", Some(&token), &request).await;
        let (_, skipped) =
            read_json(harness.post("/api/query/execute", Some(&token), &skipping).await).await;
        assert_eq!(skipped["data"]["cached"], json!(false));
        assert_eq!(harness.calls.ldap(), 2);

        let (_, after) =
            read_json(harness.post("/api/query/execute", Some(&token), &request).await).await;
        assert_eq!(after["data"]["cached"], json!(true));
        assert_eq!(harness.calls.ldap(), 2);
    })
    .await;
}

#[tokio::test]
async fn invalidating_a_query_forces_fresh_execution() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);
        let request = inactive_users(json!(90));
        harness.post("/api/query/execute", Some(&token), &request).await;

        let (_, listing) = read_json(harness.get("/api/query/cache/inactive_users", Some(&token)).await).await;
        assert_eq!(listing["data"].as_array().map(Vec::len), Some(1));

        let (status, cleared) =
            read_json(harness.delete("/api/query/cache/inactive_users", Some(&token)).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cleared["data"]["invalidated"], json!(1));

        let (_, fresh) =
            read_json(harness.post("/api/query/execute", Some(&token), &request).await).await;
        assert_eq!(fresh["data"]["cached"], json!(false));
        assert_eq!(harness.calls.ldap(), 2);

        let (_, overview) = read_json(harness.get("/api/query/cache", Some(&token)).await).await;
        assert_eq!(overview["data"]["stats"]["entries"], json!(1));
    })
    .await;
}

#[tokio::test]
async fn execution_requires_a_bearer_token() {
    with_report_harness(|harness| async move {
        let (status, body) = read_json(
            harness
                .post("/api/query/execute", None, &inactive_users(json!(90)))
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["code"], json!("UNAUTHENTICATED"));

        let (status, _) = read_json(
            harness
                .post("/api/query/execute", Some("not-a-token"), &inactive_users(json!(90)))
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(harness.calls.ldap(), 0);
    })
    .await;
}

#[tokio::test]
async fn integer_parameters_respect_their_bounds() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);
        for (days, expected) in [
            (json!(0), StatusCode::BAD_REQUEST),
            (json!(1), StatusCode::OK),
            (json!(3650), StatusCode::OK),
            (json!(3651), StatusCode::BAD_REQUEST),
            (json!("ninety"), StatusCode::BAD_REQUEST),
        ] {
            let (status, body) = read_json(
                harness
                    .post("/api/query/execute", Some(&token), &inactive_users(days.clone()))
                    .await,
            )
            .await;
            assert_eq!(status, expected, "days={days} body={body}");
            if expected == StatusCode::BAD_REQUEST {
                assert_eq!(body["code"], json!("VALIDATION_ERROR"));
                assert!(body["error"].as_str().unwrap_or_default().contains("days"));
            }
        }
    })
    .await;
}

#[tokio::test]
async fn unknown_queries_and_parameters_are_rejected() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);
        let (status, body) = read_json(
            harness
                .post("/api/query/execute", Some(&token), &json!({ "queryId": "no_such_query" }))
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], json!("NOT_FOUND"));

        let (status, _) = read_json(
            harness
                .post(
                    "/api/query/execute",
                    Some(&token),
                    &json!({ "queryId": "inactive_users", "parameters": { "days": 90, "ou": "x" } }),
                )
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    })
    .await;
}

#[tokio::test]
async fn graph_batch_isolates_failing_items() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);
        let batch = json!({
            "queries": [
                { "queryId": "graph_guest_users" },
                { "queryId": "invalid_query" }
            ]
        });
        let (status, body) =
            read_json(harness.post("/api/query/graph/batch", Some(&token), &batch).await).await;

        assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
        let results = body["data"].as_array().expect("batch results should be an array");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["queryId"], json!("graph_guest_users"));
        assert_eq!(results[0]["success"], json!(true));
        assert_eq!(results[0]["data"]["dataSource"], json!("azure"));
        assert_eq!(results[0]["data"]["rows"][0]["userType"], json!("Guest"));
        assert_eq!(results[1]["queryId"], json!("invalid_query"));
        assert_eq!(results[1]["success"], json!(false));
        assert_eq!(results[1]["code"], json!("NOT_FOUND"));
        assert_eq!(body["metadata"], json!({ "total": 2, "succeeded": 1, "failed": 1 }));

        let graph = harness
            .calls
            .last_graph
            .lock()
            .clone()
            .expect("graph should have been called");
        assert_eq!(graph.param("$filter"), Some("userType eq 'Guest'"));
    })
    .await;
}

#[tokio::test]
async fn graph_batch_limits_are_enforced() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);
        let (status, _) = read_json(
            harness
                .post("/api/query/graph/batch", Some(&token), &json!({ "queries": [] }))
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let queries: Vec<Value> = (0..6).map(|_| json!({ "queryId": "graph_guest_users" })).collect();
        let (status, _) = read_json(
            harness
                .post("/api/query/graph/batch", Some(&token), &json!({ "queries": queries }))
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(harness.calls.graph(), 0);
    })
    .await;
}

#[tokio::test]
async fn graph_routes_only_run_graph_definitions() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);
        let (status, _) = read_json(
            harness
                .post("/api/query/graph/execute", Some(&token), &inactive_users(json!(90)))
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = read_json(harness.get("/api/query/graph/definitions", Some(&token)).await).await;
        let definitions = body["data"].as_array().expect("definitions should be an array");
        assert!(!definitions.is_empty());
        assert!(definitions.iter().all(|def| {
            matches!(def["dataSource"].as_str(), Some("azure") | Some("o365"))
        }));
    })
    .await;
}

#[tokio::test]
async fn graph_history_lists_only_graph_executions() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);
        harness
            .post("/api/query/execute", Some(&token), &inactive_users(json!(90)))
            .await;
        harness
            .post(
                "/api/query/graph/execute",
                Some(&token),
                &json!({ "queryId": "graph_guest_users" }),
            )
            .await;

        let (status, body) = read_json(harness.get("/api/query/graph/history", Some(&token)).await).await;
        assert_eq!(status, StatusCode::OK);
        let items = body["data"]["items"].as_array().expect("items should be an array");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["queryId"], json!("graph_guest_users"));
        assert_eq!(items[0]["status"], json!("completed"));
    })
    .await;
}

#[tokio::test]
async fn anonymous_callers_only_see_public_definitions() {
    with_report_harness(|harness| async move {
        let (status, anonymous) = read_json(harness.get("/api/query/definitions", None).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(anonymous["data"], json!([]));

        let token = harness.token("alice", Role::User);
        let (_, body) = read_json(
            harness
                .get("/api/query/definitions?dataSource=ad", Some(&token))
                .await,
        )
        .await;
        let definitions = body["data"].as_array().expect("definitions should be an array");
        assert!(definitions.iter().any(|def| def["id"] == json!("inactive_users")));
        assert!(definitions.iter().all(|def| def["dataSource"] == json!("ad")));

        let inactive = definitions
            .iter()
            .find(|def| def["id"] == json!("inactive_users"))
            .expect("inactive_users should be listed");
        assert_eq!(inactive["parameters"][0]["name"], json!("days"));

        let (status, _) = read_json(
            harness
                .get("/api/query/definitions?dataSource=mainframe", Some(&token))
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    })
    .await;
}

#[tokio::test]
async fn preview_caps_rows_and_skips_history() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);
        let request = json!({
            "dataSource": "ad",
            "query": {
                "select": ["username", "department"],
                "where": [{ "field": "department", "operator": "equals", "value": "Finance" }],
                "limit": 1
            },
            "preview": true
        });
        let (status, body) =
            read_json(harness.post("/api/query/build", Some(&token), &request).await).await;

        assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
        assert_eq!(body["metadata"]["queryId"], json!("builder:ad"));
        assert_eq!(body["metadata"]["executionId"], Value::Null);
        assert_eq!(body["data"]["rowCount"], json!(1));
        let row = body["data"]["rows"][0].as_object().expect("row should be an object");
        let mut keys: Vec<&str> = row.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["department", "username"]);

        let ldap = harness
            .calls
            .last_ldap
            .lock()
            .clone()
            .expect("directory should have been searched");
        assert!(ldap.filter.contains("(department=Finance)"), "filter: {}", ldap.filter);

        let (_, history) = read_json(harness.get("/api/reports/history", Some(&token)).await).await;
        assert_eq!(history["data"]["items"], json!([]));
    })
    .await;
}

#[tokio::test]
async fn builder_rejects_unknown_fields_and_sources() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);
        let (status, body) = read_json(
            harness
                .post(
                    "/api/query/build",
                    Some(&token),
                    &json!({ "dataSource": "ad", "query": { "select": ["shoeSize"] } }),
                )
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap_or_default().contains("shoeSize"));

        let (status, body) = read_json(
            harness
                .post(
                    "/api/query/build",
                    Some(&token),
                    &json!({ "dataSource": "mainframe", "query": { "select": [] } }),
                )
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("UNSUPPORTED_SOURCE"));
        assert_eq!(harness.calls.ldap(), 0);
    })
    .await;
}

#[tokio::test]
async fn validation_reports_every_unknown_field() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);
        let request = json!({
            "dataSource": "ad",
            "query": {
                "select": ["username", "shoeSize"],
                "where": [{ "field": "favouriteColour", "operator": "equals", "value": "blue" }]
            }
        });
        let (status, body) =
            read_json(harness.post("/api/query/validate", Some(&token), &request).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["valid"], json!(false));
        assert_eq!(body["data"]["errors"].as_array().map(Vec::len), Some(2));

        let (_, body) = read_json(
            harness
                .post(
                    "/api/query/validate",
                    Some(&token),
                    &json!({ "queryId": "inactive_users", "parameters": { "days": 45 } }),
                )
                .await,
        )
        .await;
        assert_eq!(body["data"]["valid"], json!(true));
        assert_eq!(body["data"]["errors"], json!([]));
        assert_eq!(harness.calls.ldap(), 0);
    })
    .await;
}

#[tokio::test]
async fn connection_test_reports_failures_in_the_body() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);
        let (status, body) = read_json(
            harness
                .post(
                    "/api/query/test-connection",
                    Some(&token),
                    &json!({ "dataSource": "azure" }),
                )
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["success"], json!(false));
        assert_eq!(body["data"]["credentialId"], json!("env:azure"));
        assert!(body["data"]["error"].is_string());

        let (_, body) = read_json(
            harness
                .post("/api/query/test-connection", Some(&token), &json!({ "dataSource": "ad" }))
                .await,
        )
        .await;
        assert_eq!(body["data"]["success"], json!(true));
    })
    .await;
}

#[tokio::test]
async fn statistics_track_executions_and_cache_hits() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);
        let request = inactive_users(json!(90));
        harness.post("/api/query/execute", Some(&token), &request).await;
        harness.post("/api/query/execute", Some(&token), &request).await;

        let (status, body) =
            read_json(harness.get("/api/query/stats/inactive_users", Some(&token)).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["executions"], json!(2));
        assert_eq!(body["data"]["successes"], json!(2));
        assert_eq!(body["data"]["cacheHits"], json!(1));

        let (status, _) = read_json(harness.get("/api/query/stats/never_ran", Some(&token)).await).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    })
    .await;
}

#[tokio::test]
async fn sql_definitions_run_against_postgres() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);
        let (status, body) = read_json(
            harness
                .post(
                    "/api/query/execute",
                    Some(&token),
                    &json!({ "queryId": "recent_executions" }),
                )
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
        assert_eq!(body["metadata"]["dataSource"], json!("postgres"));
        assert_eq!(body["data"]["rows"][0]["queryId"], json!("inactive_users"));
        assert_eq!(harness.calls.sql(), 1);
    })
    .await;
}

#[tokio::test]
async fn execution_history_is_private_to_its_user() {
    with_report_harness(|harness| async move {
        let alice = harness.token("alice", Role::User);
        let bob = harness.token("bob", Role::User);
        let admin = harness.token("root", Role::Admin);

        let (_, executed) = read_json(
            harness
                .post("/api/query/execute", Some(&alice), &inactive_users(json!(90)))
                .await,
        )
        .await;
        let execution_id = executed["metadata"]["executionId"]
            .as_str()
            .expect("execution id should be recorded")
            .to_string();

        let (_, mine) = read_json(harness.get("/api/reports/history", Some(&alice)).await).await;
        assert_eq!(mine["data"]["items"].as_array().map(Vec::len), Some(1));
        assert_eq!(mine["data"]["items"][0]["status"], json!("completed"));
        assert_eq!(mine["data"]["items"][0]["rowCount"], json!(2));

        let (_, theirs) = read_json(harness.get("/api/reports/history", Some(&bob)).await).await;
        assert_eq!(theirs["data"]["items"], json!([]));

        let path = format!("/api/reports/history/{execution_id}");
        let (status, _) = read_json(harness.get(&path, Some(&bob)).await).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, record) = read_json(harness.get(&path, Some(&admin)).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["data"]["userId"], json!("alice"));
    })
    .await;
}

#[tokio::test]
async fn custom_reports_round_trip() {
    with_report_harness(|harness| async move {
        let alice = harness.token("alice", Role::User);
        let bob = harness.token("bob", Role::User);

        let (status, created) = read_json(
            harness
                .post(
                    "/api/reports/custom",
                    Some(&alice),
                    &json!({
                        "name": "Finance staff",
                        "dataSource": "ad",
                        "query": {
                            "select": ["username", "department"],
                            "where": [{ "field": "department", "operator": "equals", "value": "Finance" }]
                        }
                    }),
                )
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "unexpected body: {created}");
        let id = created["data"]["id"].as_str().expect("report id").to_string();

        let (status, _) =
            read_json(harness.get(&format!("/api/reports/custom/{id}"), Some(&bob)).await).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, executed) = read_json(
            harness
                .post(
                    &format!("/api/reports/custom/{id}/execute"),
                    Some(&alice),
                    &json!({}),
                )
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "unexpected body: {executed}");
        assert_eq!(executed["metadata"]["queryId"], json!(format!("custom:{id}")));
        assert_eq!(executed["metadata"]["queryName"], json!("Finance staff"));

        let (status, updated) = read_json(
            harness
                .put(
                    &format!("/api/reports/custom/{id}"),
                    Some(&alice),
                    &json!({ "isPublic": true }),
                )
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["data"]["isPublic"], json!(true));

        let (status, _) =
            read_json(harness.get(&format!("/api/reports/custom/{id}"), Some(&bob)).await).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = read_json(
            harness
                .delete(&format!("/api/reports/custom/{id}"), Some(&bob))
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (_, listed) = read_json(harness.get("/api/query/definitions", Some(&alice)).await).await;
        let listed = listed["data"].as_array().expect("definitions should be an array");
        assert!(listed.iter().any(|def| def["id"] == json!(format!("custom:{id}"))));

        let (status, _) = read_json(
            harness
                .delete(&format!("/api/reports/custom/{id}"), Some(&alice))
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) =
            read_json(harness.get(&format!("/api/reports/custom/{id}"), Some(&alice)).await).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    })
    .await;
}

#[tokio::test]
async fn health_is_public() {
    with_report_harness(|harness| async move {
        let (status, body) = read_json(harness.get("/health", None).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ok"));
    })
    .await;
}

#[tokio::test]
async fn backend_failures_hide_detail_and_are_not_cached() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);
        harness.calls.fail_directory(true);

        let (status, body) = read_json(
            harness
                .post("/api/query/execute", Some(&token), &inactive_users(json!(90)))
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["code"], json!("BACKEND_ERROR"));
        assert_eq!(body["error"], json!("ad backend request failed"));
        assert!(
            !body.to_string().contains("52e invalid credentials"),
            "backend detail leaked: {body}"
        );

        let (_, history) = read_json(harness.get("/api/reports/history", Some(&token)).await).await;
        let record = &history["data"]["items"][0];
        assert_eq!(record["status"], json!("failed"));
        let recorded_error = record["error"].as_str().unwrap_or_default();
        assert!(
            recorded_error.contains(DIRECTORY_FAILURE),
            "history should keep the backend detail: {record}"
        );

        let (_, cached) =
            read_json(harness.get("/api/query/cache/inactive_users", Some(&token)).await).await;
        assert_eq!(cached["data"], json!([]));

        harness.calls.fail_directory(false);
        let (status, retried) = read_json(
            harness
                .post("/api/query/execute", Some(&token), &inactive_users(json!(90)))
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(retried["data"]["cached"], json!(false));
        assert_eq!(harness.calls.ldap(), 2);
    })
    .await;
}

#[tokio::test]
async fn slow_backends_time_out_as_bad_gateway() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);
        harness.calls.delay_directory(Duration::from_millis(500));

        let request = json!({
            "queryId": "inactive_users",
            "parameters": { "days": 90 },
            "options": { "timeout": 1 }
        });
        let (status, body) =
            read_json(harness.post("/api/query/execute", Some(&token), &request).await).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], json!("BACKEND_TIMEOUT"));

        let (_, history) = read_json(harness.get("/api/reports/history", Some(&token)).await).await;
        assert_eq!(history["data"]["items"][0]["status"], json!("failed"));

        let (_, cached) =
            read_json(harness.get("/api/query/cache/inactive_users", Some(&token)).await).await;
        assert_eq!(cached["data"], json!([]));
    })
    .await;
}

#[tokio::test]
async fn malformed_bodies_use_the_error_envelope() {
    with_report_harness(|harness| async move {
        let token = harness.token("alice", Role::User);

        let response = harness
            .post_raw("/api/query/execute", Some(&token), "{\"queryId\": ")
            .await;
        let (status, body) = read_json(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["code"], json!("VALIDATION_ERROR"));

        let response = harness
            .post_raw("/api/query/graph/batch", Some(&token), "{\"queries\": 7}")
            .await;
        let (status, body) = read_json(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("VALIDATION_ERROR"));

        let response = harness
            .post_raw("/api/reports/custom/not-a-report/execute", Some(&token), "[1,")
            .await;
        let (status, body) = read_json(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("VALIDATION_ERROR"));
    })
    .await;
}
