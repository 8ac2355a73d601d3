// src/api/routes.rs
use actix_web::{web, HttpResponse};
use tracing::error;

use crate::api::types::*;
use crate::core::template::{decode_template, is_precomputed_template, LEGACY_DECODE_LEN};
use crate::core::{template::encode_template, MatchEngine};
use crate::storage::EmployeeStore;
use crate::utils::error::EngineError;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/params").route(web::get().to(params)))
        .service(web::resource("/extract_template").route(web::post().to(extract_template)))
        .service(web::resource("/test_template").route(web::post().to(test_template)))
        .service(web::resource("/match_image").route(web::post().to(match_image)))
        .service(web::resource("/match_templates").route(web::post().to(match_templates)))
        .service(web::resource("/identify_employee").route(web::post().to(identify_employee)))
        .service(web::resource("/sync_employee/{id}").route(web::post().to(sync_employee)))
        .service(web::resource("/reload_index").route(web::post().to(reload_index)));
}

fn params_view(engine: &MatchEngine) -> ParamsResponse {
    let m = &engine.config.matching;
    let d = &engine.config.detector;
    let s = &engine.config.service;
    ParamsResponse {
        fp_ratio: m.fp_ratio,
        fp_min_base: m.fp_min_base,
        fp_min_percent: m.fp_min_percent,
        fp_conf_min: m.fp_conf_min,
        fp_conf_high: m.fp_conf_high,
        fp_min_keypoints: m.fp_min_keypoints,
        fp_min_keypoints_warn: m.fp_min_keypoints_warn,
        fp_high_conf_kp: m.fp_high_conf_kp,
        fp_margin_base: m.fp_margin_base,
        fp_margin_percent: m.fp_margin_percent,
        fp_abs_min_score: m.fp_abs_min_score,
        fp_single_template_margin_min: m.fp_single_template_margin_min,
        fp_single_template_margin_ratio: m.fp_single_template_margin_ratio,
        fp_abs_min_precomputed: m.fp_abs_min_precomputed,
        fp_precomputed_slack: m.fp_precomputed_slack,
        fp_precomputed_margin: m.fp_precomputed_margin,
        fp_max_workers: s.fp_max_workers,
        fp_top_k: s.fp_top_k,
        fp_force_basic: s.force_basic(),
        threshold_for_1000_kp: engine.matcher().threshold_for(1000),
        enhancer_available: engine.enhancer_available(),
        sift_params: SiftParamsView {
            nfeatures: d.fp_sift_features,
            contrast_threshold: d.fp_sift_contrast,
            edge_threshold: d.fp_sift_edge,
            sigma: d.fp_sift_sigma,
        },
    }
}

async fn health(engine: web::Data<MatchEngine>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        message: "ridgeline matching service running",
        enhancer_available: engine.enhancer_available(),
        params: params_view(&engine),
    })
}

async fn params(engine: web::Data<MatchEngine>) -> HttpResponse {
    HttpResponse::Ok().json(params_view(&engine))
}

async fn extract_template(
    engine: web::Data<MatchEngine>,
    body: web::Json<ExtractTemplateRequest>,
) -> HttpResponse {
    if body.image_b64.trim().is_empty() {
        return bad_request("image_b64 must not be empty");
    }

    let engine = engine.into_inner();
    let image = body.into_inner().image_b64;
    let extracted = web::block(move || {
        let set = engine.pipeline().extract_image(&image, false)?;
        let template =
            encode_template(&set.keypoints, &set.descriptors, set.method, set.roi_shape)
                .map_err(|_| "deserialization_failed")?;
        Ok::<_, &'static str>((set, template))
    })
    .await;

    match extracted {
        Ok(Ok((set, template))) => HttpResponse::Ok().json(ExtractTemplateResponse {
            success: true,
            template_json: Some(template),
            keypoints_count: set.keypoint_count,
            roi_shape: Some(set.roi_shape),
            enhancement_method: Some(set.method.as_str()),
            reason: None,
        }),
        Ok(Err(reason)) => HttpResponse::Ok().json(ExtractTemplateResponse {
            success: false,
            template_json: None,
            keypoints_count: 0,
            roi_shape: None,
            enhancement_method: None,
            reason: Some(reason.to_string()),
        }),
        Err(e) => internal_error(&e.to_string()),
    }
}

async fn test_template(
    engine: web::Data<MatchEngine>,
    body: web::Json<TestTemplateRequest>,
) -> HttpResponse {
    let data = body.into_inner().image_b64;
    let detected = is_precomputed_template(&data);
    if !detected && data.trim().len() <= LEGACY_DECODE_LEN {
        return HttpResponse::Ok().json(TestTemplateResponse {
            is_precomputed: false,
            deserialized: false,
            keypoints_count: 0,
            reason: Some("not_a_template".to_string()),
            detail: None,
        });
    }

    let quality = (
        engine.config.matching.fp_min_keypoints,
        engine.config.matching.fp_min_keypoints_warn,
    );
    match decode_template(&data, quality.0, quality.1) {
        Ok(set) => HttpResponse::Ok().json(TestTemplateResponse {
            is_precomputed: detected,
            deserialized: true,
            keypoints_count: set.keypoint_count,
            reason: None,
            detail: None,
        }),
        Err(e) => HttpResponse::Ok().json(TestTemplateResponse {
            is_precomputed: detected,
            deserialized: false,
            keypoints_count: 0,
            reason: Some("deserialization_failed".to_string()),
            detail: Some(e.reason()),
        }),
    }
}

async fn match_image(
    engine: web::Data<MatchEngine>,
    body: web::Json<MatchImageRequest>,
) -> HttpResponse {
    let req = body.into_inner();
    if req.image_1_b64.trim().is_empty() || req.image_2_b64.trim().is_empty() {
        return bad_request("image_1_b64 and image_2_b64 must not be empty");
    }

    let engine = engine.into_inner();
    let outcome = web::block(move || {
        engine.match_images(&req.image_1_b64, &req.image_2_b64, req.threshold_override)
    })
    .await;

    match outcome {
        Ok(Ok(verdict)) => HttpResponse::Ok().json(MatchImageResponse {
            success: true,
            reason: verdict.reason.clone(),
            result: Some(verdict),
        }),
        Ok(Err(reason)) => HttpResponse::Ok().json(MatchImageResponse {
            success: false,
            reason: reason.to_string(),
            result: None,
        }),
        Err(e) => internal_error(&e.to_string()),
    }
}

async fn match_templates(
    engine: web::Data<MatchEngine>,
    body: web::Json<MatchTemplatesRequest>,
) -> HttpResponse {
    let req = body.into_inner();
    if req.probe_image_b64.trim().is_empty() {
        return bad_request("probe_image_b64 must not be empty");
    }
    if req.templates_b64.is_empty() {
        return bad_request("templates_b64 must not be empty");
    }

    let engine = engine.into_inner();
    let outcome = engine
        .verify_templates(&req.probe_image_b64, &req.templates_b64, req.threshold_override)
        .await;
    HttpResponse::Ok().json(outcome)
}

async fn identify_employee(
    engine: web::Data<MatchEngine>,
    body: web::Json<IdentifyRequest>,
) -> HttpResponse {
    let req = body.into_inner();
    if req.probe_image_b64.trim().is_empty() {
        return bad_request("probe_image_b64 must not be empty");
    }

    let engine = engine.into_inner();
    match engine
        .identify(&req.probe_image_b64, req.max_candidates, req.threshold_override)
        .await
    {
        Ok(outcome) => HttpResponse::Ok().json(outcome),
        Err(e) => engine_error_response(e),
    }
}

async fn sync_employee(
    engine: web::Data<MatchEngine>,
    store: web::Data<dyn EmployeeStore>,
    path: web::Path<i64>,
) -> HttpResponse {
    let employee_id = path.into_inner();
    let engine = engine.into_inner();
    match engine.sync_employee(store.as_ref(), employee_id).await {
        Ok(total) => HttpResponse::Ok().json(SyncEmployeeResponse {
            success: true,
            total_employees: total,
        }),
        Err(e) => engine_error_response(e),
    }
}

async fn reload_index(
    engine: web::Data<MatchEngine>,
    store: web::Data<dyn EmployeeStore>,
) -> HttpResponse {
    let engine = engine.into_inner();
    match engine.rebuild_index(store.as_ref()).await {
        Ok(stats) => {
            let snapshot = engine.index.snapshot();
            HttpResponse::Ok().json(ReloadIndexResponse {
                status: "ok",
                employee_count: stats.employees_loaded,
                faiss_available: snapshot.accelerator_available(),
            })
        }
        Err(e) => engine_error_response(e),
    }
}

fn bad_request(detail: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorDetail {
        detail: detail.to_string(),
    })
}

fn internal_error(detail: &str) -> HttpResponse {
    error!("internal error: {}", detail);
    HttpResponse::InternalServerError().json(ErrorDetail {
        detail: detail.to_string(),
    })
}

fn engine_error_response(e: EngineError) -> HttpResponse {
    let detail = e.to_string();
    match e {
        EngineError::IndexNotReady => HttpResponse::ServiceUnavailable().json(ErrorDetail { detail }),
        EngineError::NotFound(_) => HttpResponse::NotFound().json(ErrorDetail { detail }),
        EngineError::Conflict(_) => HttpResponse::Conflict().json(ErrorDetail { detail }),
        EngineError::Template(_) | EngineError::Image(_) => {
            HttpResponse::BadRequest().json(ErrorDetail { detail })
        }
        _ => internal_error(&detail),
    }
}
