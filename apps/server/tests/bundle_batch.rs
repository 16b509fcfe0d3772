#![allow(unused)]

mod support;

use axum::http::StatusCode;
use serde_json::{json, Value};
use support::*;

#[tokio::test]
async fn batch_reports_each_entry_independently() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let bundle = BundleBuilder::batch()
                .get("Patient/missing")
                .post(None, "Patient", patient("Survivor"))
                .get("Patient?_unknown=1")
                .build();
            let (status, body) = app.post_bundle(&bundle).await?;

            assert_status(status, StatusCode::OK, "batch");
            assert_bundle_type(&body, "batch-response")?;
            let entries = get_bundle_entries(&body)?;
            assert_eq!(entries.len(), 3);
            assert_eq!(entry_status(&entries[0])?, "404");
            assert_eq!(entry_status(&entries[1])?, "201");
            assert_eq!(entry_status(&entries[2])?, "400");

            let outcome = &entries[0]["response"]["outcome"];
            assert_eq!(outcome["resourceType"], "OperationOutcome");
            assert_eq!(issue_codes(outcome), vec!["not-found".to_string()]);
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn batch_delete_runs_before_read() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let mut resource = patient("Transient");
            resource["id"] = json!("transient");
            let seed = BundleBuilder::batch().put("Patient/transient", resource).build();
            let (_, body) = app.post_bundle(&seed).await?;
            assert_eq!(entry_status(&get_bundle_entries(&body)?[0])?, "201");

            let bundle = BundleBuilder::batch()
                .get("Patient/transient")
                .delete("Patient/transient")
                .build();
            let (status, body) = app.post_bundle(&bundle).await?;

            assert_status(status, StatusCode::OK, "batch");
            let entries = get_bundle_entries(&body)?;
            assert_eq!(entry_status(&entries[0])?, "410");
            assert_eq!(entry_status(&entries[1])?, "200");
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn batch_search_returns_searchset() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let seed = BundleBuilder::batch()
                .post(None, "Patient", patient("A"))
                .post(None, "Patient", patient("B"))
                .build();
            app.post_bundle(&seed).await?;

            let bundle = BundleBuilder::batch()
                .get("Patient?gender=female&_count=1")
                .build();
            let (_, body) = app.post_bundle(&bundle).await?;

            let entries = get_bundle_entries(&body)?;
            assert_eq!(entry_status(&entries[0])?, "200");
            let searchset = &entries[0]["resource"];
            assert_bundle_type(searchset, "searchset")?;
            assert_eq!(searchset["total"], 2);
            assert_eq!(get_bundle_entries(searchset)?.len(), 1);
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn prefer_minimal_omits_resource_bodies() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let bundle = BundleBuilder::batch()
                .post(None, "Patient", patient("Quiet"))
                .build();
            let (status, body) = app
                .post_bundle_with_headers(&bundle, &[("prefer", "return=minimal")])
                .await?;

            assert_status(status, StatusCode::OK, "batch");
            let entries = get_bundle_entries(&body)?;
            assert_eq!(entry_status(&entries[0])?, "201");
            assert!(entries[0].get("resource").is_none());
            assert!(entries[0]["response"]["location"].is_string());
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn prefer_operation_outcome_adds_outcome() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let bundle = BundleBuilder::batch()
                .post(None, "Patient", patient("Loud"))
                .build();
            let (_, body) = app
                .post_bundle_with_headers(&bundle, &[("prefer", "return=OperationOutcome")])
                .await?;

            let entries = get_bundle_entries(&body)?;
            assert!(entries[0].get("resource").is_none());
            let outcome = &entries[0]["response"]["outcome"];
            assert_eq!(outcome["resourceType"], "OperationOutcome");
            assert_eq!(issue_codes(outcome), vec!["informational".to_string()]);
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn full_url_uses_forwarded_host() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let bundle = BundleBuilder::batch()
                .post(None, "Patient", patient("Hosted"))
                .build();
            let (_, body) = app
                .post_bundle_with_headers(
                    &bundle,
                    &[
                        ("x-forwarded-proto", "https"),
                        ("x-forwarded-host", "fhir.example.com"),
                    ],
                )
                .await?;

            let entries = get_bundle_entries(&body)?;
            let id = entries[0]["resource"]["id"].as_str().unwrap_or_default();
            assert_eq!(
                entries[0]["fullUrl"],
                json!(format!("https://fhir.example.com/fhir/Patient/{id}"))
            );
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn history_and_vread_reflect_updates() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let mut resource = patient("Historic");
            resource["id"] = json!("historic");
            let seed = BundleBuilder::batch()
                .put("Patient/historic", resource.clone())
                .build();
            app.post_bundle(&seed).await?;
            resource["active"] = json!(false);
            let update = BundleBuilder::batch().put("Patient/historic", resource).build();
            app.post_bundle(&update).await?;

            let bundle = BundleBuilder::batch()
                .get("Patient/historic/_history")
                .get("Patient/historic/_history/1")
                .get("Patient/historic/_history/9")
                .build();
            let (_, body) = app.post_bundle(&bundle).await?;
            let entries = get_bundle_entries(&body)?;

            assert_eq!(entry_status(&entries[0])?, "200");
            let history = &entries[0]["resource"];
            assert_bundle_type(history, "history")?;
            assert_eq!(history["total"], 2);

            assert_eq!(entry_status(&entries[1])?, "200");
            assert_version_id(&entries[1]["resource"], "1")?;
            assert_eq!(entries[1]["resource"]["active"], true);

            assert_eq!(entry_status(&entries[2])?, "404");
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn meta_operation_is_invoked() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let mut resource = patient("Tagged");
            resource["id"] = json!("tagged");
            let seed = BundleBuilder::batch().put("Patient/tagged", resource).build();
            app.post_bundle(&seed).await?;

            let bundle = BundleBuilder::batch()
                .get("Patient/tagged/$meta")
                .get("$bogus")
                .build();
            let (_, body) = app.post_bundle(&bundle).await?;
            let entries = get_bundle_entries(&body)?;

            assert_eq!(entry_status(&entries[0])?, "200");
            let parameters = &entries[0]["resource"];
            assert_eq!(parameters["resourceType"], "Parameters");
            assert_eq!(parameters["parameter"][0]["name"], "return");
            assert_eq!(
                parameters["parameter"][0]["valueMeta"]["versionId"],
                json!("1")
            );

            assert_ne!(entry_status(&entries[1])?, "200");
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn batch_payloads_are_written_for_creates() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let bundle = BundleBuilder::batch()
                .post(None, "Patient", patient("One"))
                .post(None, "Patient", patient("Two"))
                .build();
            app.post_bundle(&bundle).await?;

            assert_eq!(app.payloads.len().await, 2);
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn batch_put_after_delete_recreates_unchanged_resource() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let mut resource = patient("Stable");
            resource["id"] = json!("stable");
            let seed = BundleBuilder::batch()
                .put("Patient/stable", resource.clone())
                .build();
            app.post_bundle(&seed).await?;

            let bundle = BundleBuilder::batch()
                .delete("Patient/stable")
                .put("Patient/stable", resource)
                .build();
            let (status, body) = app.post_bundle(&bundle).await?;

            assert_status(status, StatusCode::OK, "batch");
            let entries = get_bundle_entries(&body)?;
            assert_eq!(entry_status(&entries[0])?, "200");
            assert_eq!(entry_status(&entries[1])?, "201");
            assert_version_id(&entries[1]["resource"], "3")?;

            let read = BundleBuilder::batch().get("Patient/stable").build();
            let (_, body) = app.post_bundle(&read).await?;
            let entries = get_bundle_entries(&body)?;
            assert_eq!(entry_status(&entries[0])?, "200");
            assert_eq!(entries[0]["resource"]["active"], true);
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn batch_patch_after_put_keeps_both_changes() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let mut resource = patient("Evolving");
            resource["id"] = json!("evolving");
            let seed = BundleBuilder::batch()
                .put("Patient/evolving", resource.clone())
                .build();
            app.post_bundle(&seed).await?;

            resource["gender"] = json!("male");
            let bundle = BundleBuilder::batch()
                .put("Patient/evolving", resource)
                .json_patch(
                    "Patient/evolving",
                    json!([{"op": "replace", "path": "/active", "value": false}]),
                )?
                .build();
            let (_, body) = app.post_bundle(&bundle).await?;
            let entries = get_bundle_entries(&body)?;
            assert_eq!(entry_status(&entries[0])?, "200");
            assert_eq!(entry_status(&entries[1])?, "200");

            let read = BundleBuilder::batch().get("Patient/evolving").build();
            let (_, body) = app.post_bundle(&read).await?;
            let stored = &get_bundle_entries(&body)?[0]["resource"];
            assert_version_id(stored, "3")?;
            assert_eq!(stored["gender"], "male");
            assert_eq!(stored["active"], false);
            Ok(())
        })
    })
    .await
}
