use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::manager::{
    ForwardManager,
    ManagerError,
};
use crate::rpc::protocol::{
    error_codes,
    ApplyConfigParams,
    ApplyConfigResult,
    CreateForwardParams,
    DeleteGroupResult,
    ExportConfigParams,
    ExportConfigResult,
    GetForwardResult,
    GroupParams,
    JsonRpcRequest,
    JsonRpcResponse,
    ListForwardsParams,
    ListForwardsResult,
    ListGroupsResult,
    MutationResult,
    NameParams,
    RequestId,
    StatusResult,
    JSONRPC_VERSION,
};

pub struct RpcContext {
    pub manager: Arc<ForwardManager>,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

/// Dispatches one JSON-RPC request to the manager.
pub async fn handle_json_rpc_request(request: JsonRpcRequest, ctx: &RpcContext) -> JsonRpcResponse {
    if request.jsonrpc != JSONRPC_VERSION {
        return JsonRpcResponse::error(
            request.id,
            error_codes::INVALID_REQUEST,
            format!("unsupported JSON-RPC version '{}'", request.jsonrpc),
        );
    }

    let id = request.id;
    match request.method.as_str() {
        "CreateForward" => match parse_params::<CreateForwardParams>(request.params) {
            Ok(params) => {
                let outcome = ctx.manager.add_or_update(params.definition).await;
                result_response(id, mutation_result(outcome))
            }
            Err(message) => invalid_params(id, message),
        },
        "DeleteForward" => match parse_params::<NameParams>(request.params) {
            Ok(params) => {
                let outcome = ctx.manager.delete(&params.name).await;
                result_response(id, mutation_result(outcome))
            }
            Err(message) => invalid_params(id, message),
        },
        "ListForwards" => match parse_optional_params::<ListForwardsParams>(request.params) {
            Ok(params) => {
                let forwards = ctx.manager.statuses(params.group_filter.as_deref());
                result_response(id, ListForwardsResult { forwards })
            }
            Err(message) => invalid_params(id, message),
        },
        "GetForward" => match parse_params::<NameParams>(request.params) {
            Ok(params) => {
                let forward = ctx.manager.get_status(&params.name);
                result_response(
                    id,
                    GetForwardResult {
                        found: forward.is_some(),
                        forward,
                    },
                )
            }
            Err(message) => invalid_params(id, message),
        },
        "StartForward" => match parse_params::<NameParams>(request.params) {
            Ok(params) => {
                let outcome = ctx.manager.start(&params.name).await;
                result_response(id, mutation_result(outcome))
            }
            Err(message) => invalid_params(id, message),
        },
        "StopForward" => match parse_params::<NameParams>(request.params) {
            Ok(params) => {
                let outcome = ctx.manager.stop(&params.name).await;
                result_response(id, mutation_result(outcome))
            }
            Err(message) => invalid_params(id, message),
        },
        "ListGroups" => {
            let groups = ctx.manager.get_group_statuses();
            result_response(id, ListGroupsResult { groups })
        }
        "EnableGroup" => match parse_params::<GroupParams>(request.params) {
            Ok(params) => {
                let outcome = ctx.manager.enable_group(&params.group).await;
                result_response(id, mutation_result(outcome))
            }
            Err(message) => invalid_params(id, message),
        },
        "DisableGroup" => match parse_params::<GroupParams>(request.params) {
            Ok(params) => {
                let outcome = ctx.manager.disable_group(&params.group).await;
                result_response(id, mutation_result(outcome))
            }
            Err(message) => invalid_params(id, message),
        },
        "DeleteGroup" => match parse_params::<GroupParams>(request.params) {
            Ok(params) => {
                let result = match ctx.manager.delete_group(&params.group).await {
                    Ok(deleted) => DeleteGroupResult {
                        success: true,
                        deleted,
                        error: None,
                    },
                    Err(e) => DeleteGroupResult {
                        success: false,
                        deleted: 0,
                        error: Some(e.to_string()),
                    },
                };
                result_response(id, result)
            }
            Err(message) => invalid_params(id, message),
        },
        "ApplyConfig" => match parse_params::<ApplyConfigParams>(request.params) {
            Ok(params) => {
                let result = match ctx
                    .manager
                    .apply_config(
                        &params.config_json,
                        params.target_group.as_deref(),
                        params.remove_missing,
                    )
                    .await
                {
                    Ok(outcome) => ApplyConfigResult {
                        success: true,
                        added: outcome.added,
                        updated: outcome.updated,
                        removed: outcome.removed,
                        error: None,
                    },
                    Err(e) => ApplyConfigResult {
                        success: false,
                        added: 0,
                        updated: 0,
                        removed: 0,
                        error: Some(e.to_string()),
                    },
                };
                result_response(id, result)
            }
            Err(message) => invalid_params(id, message),
        },
        "ExportConfig" => match parse_optional_params::<ExportConfigParams>(request.params) {
            Ok(params) => {
                match ctx
                    .manager
                    .export_config(params.include_disabled, params.group_filter.as_deref())
                    .await
                {
                    Ok(config_json) => result_response(id, ExportConfigResult { config_json }),
                    Err(e) => {
                        JsonRpcResponse::error(id, error_codes::INTERNAL_ERROR, e.to_string())
                    }
                }
            }
            Err(message) => invalid_params(id, message),
        },
        "ReloadConfig" => {
            ctx.manager.reload_config().await;
            result_response(id, MutationResult::ok())
        }
        "GetStatus" => {
            let (active_forward_count, total_forward_count) = ctx.manager.counts();
            result_response(
                id,
                StatusResult {
                    running: true,
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    active_forward_count,
                    total_forward_count,
                    uptime_seconds: ctx.started_at.elapsed().as_secs(),
                },
            )
        }
        "Shutdown" => {
            info!("shutdown requested over RPC");
            ctx.shutdown.cancel();
            result_response(id, MutationResult::ok())
        }
        _ => JsonRpcResponse::error(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("method '{}' not found", request.method),
        ),
    }
}

fn mutation_result(outcome: Result<(), ManagerError>) -> MutationResult {
    match outcome {
        Ok(()) => MutationResult::ok(),
        Err(e) => MutationResult::failure(e.to_string()),
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, String> {
    let params = params.ok_or_else(|| "missing params".to_string())?;
    serde_json::from_value(params).map_err(|e| e.to_string())
}

fn parse_optional_params<T: DeserializeOwned + Default>(
    params: Option<Value>,
) -> Result<T, String> {
    match params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value).map_err(|e| e.to_string()),
    }
}

fn invalid_params(id: Option<RequestId>, message: String) -> JsonRpcResponse {
    JsonRpcResponse::error(id, error_codes::INVALID_PARAMS, message)
}

fn result_response(id: Option<RequestId>, result: impl Serialize) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(
            id,
            error_codes::INTERNAL_ERROR,
            format!("failed to serialize result: {e}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    use kubeportal_commons::ConfigStore;
    use kubeportal_portforward::{
        KubeCache,
        KubeconfigClientFactory,
    };

    use super::*;

    fn test_context(dir: &TempDir) -> RpcContext {
        let store = ConfigStore::new(dir.path().join("config.json"));
        let kube_cache = Arc::new(KubeCache::new(Arc::new(KubeconfigClientFactory)));
        RpcContext {
            manager: Arc::new(ForwardManager::new(
                store,
                kube_cache,
                CancellationToken::new(),
            )),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    fn request(method: &str, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id: Some(RequestId::Number(1)),
        }
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn definition_params(name: &str, port: u16, enabled: bool) -> Value {
        serde_json::json!({
            "definition": {
                "type": "socket",
                "name": name,
                "group": "default",
                "localPort": port,
                "enabled": enabled,
                "remoteHost": "127.0.0.1",
                "remotePort": 9,
            }
        })
    }

    #[tokio::test]
    async fn test_create_list_and_get() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        let port = free_port().await;

        let response = handle_json_rpc_request(
            request("CreateForward", Some(definition_params("pg", port, false))),
            &ctx,
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["success"], true);

        let response =
            handle_json_rpc_request(request("ListForwards", None), &ctx).await;
        let result = response.result.unwrap();
        let forwards = result["forwards"].as_array().unwrap();
        assert_eq!(forwards.len(), 1);
        assert_eq!(forwards[0]["name"], "pg");
        assert_eq!(forwards[0]["type"], "socket");
        assert_eq!(forwards[0]["active"], false);
        assert_eq!(forwards[0]["bytesTransferred"], 0);

        let response = handle_json_rpc_request(
            request("GetForward", Some(serde_json::json!({"name": "pg"}))),
            &ctx,
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["found"], true);
        assert_eq!(result["forward"]["localPort"], port);

        let response = handle_json_rpc_request(
            request("GetForward", Some(serde_json::json!({"name": "nope"}))),
            &ctx,
        )
        .await;
        assert_eq!(response.result.unwrap()["found"], false);
    }

    #[tokio::test]
    async fn test_semantic_failures_travel_in_result() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);

        let response = handle_json_rpc_request(
            request("DeleteForward", Some(serde_json::json!({"name": "ghost"}))),
            &ctx,
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["success"], false);
        assert!(result["error"].as_str().unwrap().contains("not found"));

        // An invalid definition is a semantic failure as well.
        let response = handle_json_rpc_request(
            request("CreateForward", Some(definition_params("", 5432, false))),
            &ctx,
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["success"], false);
    }

    #[tokio::test]
    async fn test_transport_level_errors() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);

        let response = handle_json_rpc_request(request("NoSuchMethod", None), &ctx).await;
        assert_eq!(
            response.error.unwrap().code,
            error_codes::METHOD_NOT_FOUND
        );

        let response = handle_json_rpc_request(request("CreateForward", None), &ctx).await;
        assert_eq!(response.error.unwrap().code, error_codes::INVALID_PARAMS);

        let response = handle_json_rpc_request(
            request(
                "CreateForward",
                Some(serde_json::json!({"definition": {"type": "udp"}})),
            ),
            &ctx,
        )
        .await;
        assert_eq!(response.error.unwrap().code, error_codes::INVALID_PARAMS);

        let mut bad_version = request("GetStatus", None);
        bad_version.jsonrpc = "1.0".to_string();
        let response = handle_json_rpc_request(bad_version, &ctx).await;
        assert_eq!(response.error.unwrap().code, error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_get_status_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        let port = free_port().await;

        handle_json_rpc_request(
            request("CreateForward", Some(definition_params("pg", port, false))),
            &ctx,
        )
        .await;

        let response = handle_json_rpc_request(request("GetStatus", None), &ctx).await;
        let result = response.result.unwrap();
        assert_eq!(result["running"], true);
        assert_eq!(result["totalForwardCount"], 1);
        assert_eq!(result["activeForwardCount"], 0);
        assert_eq!(result["version"], env!("CARGO_PKG_VERSION"));

        assert!(!ctx.shutdown.is_cancelled());
        let response = handle_json_rpc_request(request("Shutdown", None), &ctx).await;
        assert_eq!(response.result.unwrap()["success"], true);
        assert!(ctx.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_apply_and_export_over_rpc() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        let port = free_port().await;

        let config_json = serde_json::json!({
            "forwards": {
                "pg": {
                    "type": "socket",
                    "name": "pg",
                    "localPort": port,
                    "enabled": false,
                    "remoteHost": "127.0.0.1",
                    "remotePort": 9,
                }
            }
        })
        .to_string();

        let response = handle_json_rpc_request(
            request(
                "ApplyConfig",
                Some(serde_json::json!({
                    "configJson": config_json,
                    "targetGroup": "dev",
                    "removeMissing": false,
                })),
            ),
            &ctx,
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["added"], 1);
        assert_eq!(result["updated"], 0);
        assert_eq!(result["removed"], 0);

        let response = handle_json_rpc_request(
            request(
                "ExportConfig",
                Some(serde_json::json!({"includeDisabled": true})),
            ),
            &ctx,
        )
        .await;
        let result = response.result.unwrap();
        let exported: Value =
            serde_json::from_str(result["configJson"].as_str().unwrap()).unwrap();
        assert!(exported["forwards"].as_object().unwrap().contains_key("pg"));
        assert_eq!(exported["forwards"]["pg"]["group"], "dev");
    }

    #[tokio::test]
    async fn test_group_methods_over_rpc() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        let port = free_port().await;

        handle_json_rpc_request(
            request("CreateForward", Some(definition_params("pg", port, false))),
            &ctx,
        )
        .await;

        let response = handle_json_rpc_request(request("ListGroups", None), &ctx).await;
        let result = response.result.unwrap();
        let groups = result["groups"].as_array().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0]["name"], "default");
        assert_eq!(groups[0]["enabled"], false);
        assert_eq!(groups[0]["totalForwardCount"], 1);

        let response = handle_json_rpc_request(
            request("DeleteGroup", Some(serde_json::json!({"group": "default"}))),
            &ctx,
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["deleted"], 1);
    }
}
