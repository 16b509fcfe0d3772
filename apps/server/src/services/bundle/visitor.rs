//! Interaction visitor contract
//!
//! A processing stage implements one method per interaction kind. Methods
//! default to doing nothing, so a stage only spells out the kinds it cares
//! about. Returning `Some(response)` hands the result back to the interaction
//! through `BundleInteraction::accept`.

use async_trait::async_trait;

use super::interaction::{
    CreateRequest, DeleteRequest, EntryContext, HistoryRequest, InvokeRequest, IssueRequest,
    PatchRequest, ReadRequest, SearchRequest, UpdateRequest, VReadRequest,
    ValidationResponseRequest,
};
use super::response::OperationResponse;
use crate::Result;

#[async_trait]
pub trait InteractionVisitor: Send {
    async fn do_search(
        &mut self,
        _ctx: &EntryContext,
        _request: &SearchRequest,
    ) -> Result<Option<OperationResponse>> {
        Ok(None)
    }

    async fn do_vread(
        &mut self,
        _ctx: &EntryContext,
        _request: &VReadRequest,
    ) -> Result<Option<OperationResponse>> {
        Ok(None)
    }

    async fn do_read(
        &mut self,
        _ctx: &EntryContext,
        _request: &ReadRequest,
    ) -> Result<Option<OperationResponse>> {
        Ok(None)
    }

    async fn do_history(
        &mut self,
        _ctx: &EntryContext,
        _request: &HistoryRequest,
    ) -> Result<Option<OperationResponse>> {
        Ok(None)
    }

    async fn do_create(
        &mut self,
        _ctx: &EntryContext,
        _request: &mut CreateRequest,
    ) -> Result<Option<OperationResponse>> {
        Ok(None)
    }

    async fn do_update(
        &mut self,
        _ctx: &EntryContext,
        _request: &mut UpdateRequest,
    ) -> Result<Option<OperationResponse>> {
        Ok(None)
    }

    async fn do_patch(
        &mut self,
        _ctx: &EntryContext,
        _request: &mut PatchRequest,
    ) -> Result<Option<OperationResponse>> {
        Ok(None)
    }

    async fn do_delete(
        &mut self,
        _ctx: &EntryContext,
        _request: &DeleteRequest,
    ) -> Result<Option<OperationResponse>> {
        Ok(None)
    }

    async fn do_invoke(
        &mut self,
        _ctx: &EntryContext,
        _request: &InvokeRequest,
    ) -> Result<Option<OperationResponse>> {
        Ok(None)
    }

    /// Entry whose response was already decided while preparing the bundle.
    async fn validation_response(
        &mut self,
        _ctx: &EntryContext,
        _request: &mut ValidationResponseRequest,
    ) -> Result<Option<OperationResponse>> {
        Ok(None)
    }

    /// Entry that failed preparation in a batch.
    async fn issue(
        &mut self,
        _ctx: &EntryContext,
        _request: &mut IssueRequest,
    ) -> Result<Option<OperationResponse>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::bundle::interaction::{BundleInteraction, Interaction};
    use axum::http::StatusCode;
    use serde_json::json;
    use tessera_models::BundleEntryRequest;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<&'static str>,
    }

    #[async_trait]
    impl InteractionVisitor for Recorder {
        async fn do_read(
            &mut self,
            _ctx: &EntryContext,
            _request: &ReadRequest,
        ) -> Result<Option<OperationResponse>> {
            self.seen.push("read");
            Ok(None)
        }

        async fn do_create(
            &mut self,
            _ctx: &EntryContext,
            request: &mut CreateRequest,
        ) -> Result<Option<OperationResponse>> {
            self.seen.push("create");
            let mut rewritten = request.resource.clone();
            rewritten["active"] = json!(true);
            Ok(Some(
                OperationResponse::new(StatusCode::CREATED).with_resource(rewritten),
            ))
        }
    }

    fn ctx(method: &str, url: &str) -> EntryContext {
        let request = BundleEntryRequest {
            method: method.to_string(),
            url: url.to_string(),
            ..Default::default()
        };
        EntryContext::new(0, Some(&request), None)
    }

    #[tokio::test]
    async fn test_accept_dispatches_by_kind() -> anyhow::Result<()> {
        let mut recorder = Recorder::default();

        let mut read = BundleInteraction::new(
            ctx("GET", "Patient/p1"),
            Interaction::Read(ReadRequest {
                resource_type: "Patient".into(),
                id: "p1".into(),
                head: false,
            }),
        );
        read.accept(&mut recorder).await?;

        let mut delete = BundleInteraction::new(
            ctx("DELETE", "Patient/p1"),
            Interaction::Delete(DeleteRequest {
                resource_type: "Patient".into(),
                id: Some("p1".into()),
                search_query: None,
            }),
        );
        delete.accept(&mut recorder).await?;

        assert_eq!(recorder.seen, vec!["read"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_accept_folds_response_back_into_create() -> anyhow::Result<()> {
        let mut recorder = Recorder::default();
        let mut create = BundleInteraction::new(
            ctx("POST", "Patient"),
            Interaction::Create(CreateRequest {
                resource_type: "Patient".into(),
                id: "p1".into(),
                resource: json!({"resourceType": "Patient"}),
                local_id: None,
                warnings: Vec::new(),
                pending_payload: None,
            }),
        );
        create.accept(&mut recorder).await?;

        match &create.interaction {
            Interaction::Create(request) => assert_eq!(request.resource["active"], true),
            other => panic!("unexpected interaction {}", other.label()),
        }
        Ok(())
    }
}
