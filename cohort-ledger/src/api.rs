use crate::dataset;
use crate::db::QueryLogEntry;
use crate::errors::ApiError;
use crate::models::*;
use crate::query;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, Request, State},
    http::HeaderMap,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use cohort_zk::constants::{CURVE, PROOF_SYSTEM};
use cohort_zk::groth16::{deserialize_proof, deserialize_vk, serialize_vk, verify_with_vk};
use cohort_zk::{ShardPublicInputs, ZkError};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

const DEFAULT_PAGE: u64 = 50;
const MAX_PAGE: u64 = 500;

pub fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/api/v1/datasets", post(create_dataset))
        .route("/api/v1/queries", post(create_query))
        .route("/api/v1/verify/shard", post(verify_shard))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1/datasets/:id", get(get_dataset))
        .route("/api/v1/datasets/:id/shards", get(list_shards))
        .route("/api/v1/buckets", get(get_buckets))
        .route("/api/v1/zk/vk", get(get_vk))
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(provided_key) = headers.get("X-API-KEY") {
        if provided_key == state.config.api_key.as_str() {
            return Ok(next.run(request).await);
        }
    }

    tracing::warn!(path = %request.uri().path(), "unauthorized access attempt");
    Err(ApiError::Unauthorized)
}

fn internal(e: ZkError) -> ApiError {
    tracing::error!(error = %e, "zk error");
    ApiError::Internal
}

async fn create_dataset(
    State(state): State<AppState>,
    Json(req): Json<DatasetCreateRequest>,
) -> Result<Json<DatasetCreateResponse>, ApiError> {
    // The job reports through the ledger; nobody awaits it here.
    let (dataset_id, _job) = dataset::create_dataset(&state, req.dataset_size).await?;
    tracing::info!(%dataset_id, "dataset generation scheduled");

    Ok(Json(DatasetCreateResponse { dataset_id }))
}

async fn get_dataset(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<DatasetGetResponse>, ApiError> {
    let Some(row) = state.ledger.get_dataset(id).await? else {
        return Err(ApiError::NotFound("dataset not found".to_string()));
    };

    Ok(Json(DatasetGetResponse {
        dataset_id: row.id,
        created_at: row.created_at,
        dataset_size: row.dataset_size,
        shard_size: row.shard_size,
        num_buckets: row.num_buckets,
        status: row.status,
        shards_total: row.shards_total,
        shards_done: row.shards_done,
        dataset_commitment_hex: row.dataset_commitment_hex,
        error: row.error,
    }))
}

async fn list_shards(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<ListShardsParams>,
) -> Result<Json<ShardListResponse>, ApiError> {
    let offset = params.offset.unwrap_or(0);
    let limit = params.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);
    let include_proof = params.include_proof.unwrap_or(false);

    let Some(dataset) = state.ledger.get_dataset(id).await? else {
        return Err(ApiError::NotFound("dataset not found".to_string()));
    };

    let rows = state.ledger.list_shards(id, offset, limit, include_proof).await?;
    let shards = rows
        .into_iter()
        .map(|row| ShardListItem {
            shard_index: row.shard_index,
            shard_commitment_hex: row.shard_commitment_hex,
            sum_glucose_by_bucket: row.stats.sum_glucose_by_bucket,
            count_by_bucket: row.stats.count_by_bucket,
            verified: row.verified,
            proof_b64: row.proof_b64,
        })
        .collect();

    Ok(Json(ShardListResponse {
        dataset_id: id,
        offset,
        limit,
        shards_total: dataset.shards_total,
        shards,
    }))
}

async fn create_query(State(state): State<AppState>, Json(req): Json<QueryRequest>) -> Result<Json<QueryResponse>, ApiError> {
    let result = query::evaluate(&state.ledger, &state.keys, req.dataset_id, req.age_range).await?;

    let query_id = Uuid::new_v4();
    state
        .ledger
        .insert_query(&QueryLogEntry {
            query_id,
            dataset_id: req.dataset_id,
            metric: req.metric,
            bucket_index: result.bucket.index,
            sum: result.sum,
            count: result.count,
            mean: result.mean,
            verified: result.server_verified,
        })
        .await?;

    tracing::info!(
        %query_id,
        dataset_id = %req.dataset_id,
        bucket_index = result.bucket.index,
        server_verified = result.server_verified,
        "query answered"
    );

    Ok(Json(QueryResponse {
        query_id,
        dataset_id: req.dataset_id,
        metric: req.metric,
        bucket_index: result.bucket.index,
        bucket_range: (result.bucket.min_age, result.bucket.max_age),
        sum_glucose: result.sum,
        count: result.count,
        mean_glucose: result.mean,
        server_verified: result.server_verified,
        shard_proofs_endpoint: format!("/api/v1/datasets/{}/shards?include_proof=true", req.dataset_id),
    }))
}

async fn get_buckets(State(state): State<AppState>) -> Json<BucketsResponse> {
    Json(BucketsResponse { buckets: state.keys.shape().buckets.buckets().to_vec() })
}

async fn get_vk(State(state): State<AppState>) -> Result<Json<ZkVkResponse>, ApiError> {
    let vk_bytes = serialize_vk(state.keys.verifying_key()).map_err(internal)?;

    Ok(Json(ZkVkResponse {
        curve: CURVE.to_string(),
        proof_system: PROOF_SYSTEM.to_string(),
        shard_size: state.shard_size() as u64,
        vk_b64: base64::engine::general_purpose::STANDARD.encode(vk_bytes),
    }))
}

async fn verify_shard(State(state): State<AppState>, Json(req): Json<VerifyShardRequest>) -> Result<Json<VerifyShardResponse>, ApiError> {
    let b64 = base64::engine::general_purpose::STANDARD;

    let proof_bytes = b64.decode(&req.proof_b64).map_err(|_| ApiError::BadRequest("invalid proof_b64".to_string()))?;
    let proof = deserialize_proof(&proof_bytes).map_err(|_| ApiError::BadRequest("invalid proof".to_string()))?;

    let digest = ShardPublicInputs {
        shard_commitment_hex: req.public_shard_commitment_hex,
        sum_glucose_by_bucket: req.public_sum_glucose_by_bucket,
        count_by_bucket: req.public_count_by_bucket,
    }
    .to_digest()
    .map_err(|_| ApiError::BadRequest("invalid shard commitment".to_string()))?;

    // Verification is CPU-bound pairing work.
    let keys = state.keys.clone();
    let ok = tokio::task::spawn_blocking(move || -> Result<bool, ApiError> {
        let verdict = match req.vk_b64 {
            Some(vk_b64) => {
                let vk_bytes = b64.decode(vk_b64).map_err(|_| ApiError::BadRequest("invalid vk_b64".to_string()))?;
                let vk = deserialize_vk(&vk_bytes).map_err(|_| ApiError::BadRequest("invalid vk".to_string()))?;
                verify_with_vk(&vk, &proof, &digest)
            }
            None => keys.verify(&proof, &digest),
        };
        Ok(matches!(verdict, Ok(true)))
    })
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "verifier task failed");
        ApiError::Internal
    })??;

    Ok(Json(VerifyShardResponse { ok }))
}
