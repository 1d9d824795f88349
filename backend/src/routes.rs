use actix_multipart::Multipart;
use actix_web::{HttpResponse, web};
use serde_json::json;
use shared::{CorrectionRequest, CreateBatchRequest, SwitchModelRequest};
use uuid::Uuid;

use crate::auth::{AuthMiddleware, AuthenticatedUser};
use crate::error::ClassifyError;
use crate::pipeline::{ClassificationService, RequestContext};
use crate::upload::read_form;

pub fn configure_routes(cfg: &mut web::ServiceConfig, auth_middleware: AuthMiddleware) {
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(
            web::scope("/api")
                .wrap(auth_middleware)
                .service(
                    web::resource("/classifications")
                        .route(web::post().to(classify_image))
                        .route(web::get().to(list_classifications)),
                )
                .service(
                    web::resource("/classifications/batch").route(web::post().to(classify_batch)),
                )
                .service(
                    web::resource("/classifications/statistics")
                        .route(web::get().to(classification_statistics)),
                )
                .service(
                    web::resource("/classifications/{id}")
                        .route(web::get().to(get_classification))
                        .route(web::patch().to(correct_classification)),
                )
                .service(web::resource("/batches").route(web::post().to(create_batch)))
                .service(web::resource("/batches/{id}").route(web::get().to(get_batch)))
                .service(web::resource("/model").route(web::get().to(model_info)))
                .service(web::resource("/model/reload").route(web::post().to(reload_model)))
                .service(web::resource("/model/switch").route(web::post().to(switch_model))),
        );
}

async fn health(service: web::Data<ClassificationService>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "model_loaded": service.model_loaded(),
    }))
}

async fn classify_image(
    user: AuthenticatedUser,
    service: web::Data<ClassificationService>,
    payload: Multipart,
) -> Result<HttpResponse, ClassifyError> {
    let mut form = read_form(payload, "image", 1, service.max_upload_bytes()).await?;
    if form.images.len() != 1 {
        return Err(ClassifyError::bad_field(
            "image",
            format!("expected exactly one image, got {}", form.images.len()),
        ));
    }
    let context = RequestContext {
        user_id: user.id(),
        farm_id: form.farm_id,
        batch_id: form.batch_id,
        tta: form.tta,
    };
    let upload = form.images.remove(0);

    let response = service.classify(&context, upload).await?;
    Ok(HttpResponse::Created().json(response))
}

async fn classify_batch(
    user: AuthenticatedUser,
    service: web::Data<ClassificationService>,
    payload: Multipart,
) -> Result<HttpResponse, ClassifyError> {
    let form = read_form(
        payload,
        "images",
        service.max_batch_images(),
        service.max_upload_bytes(),
    )
    .await?;
    let context = RequestContext {
        user_id: user.id(),
        farm_id: form.farm_id,
        batch_id: form.batch_id,
        tta: form.tta,
    };

    let response = service.classify_batch(&context, form.images).await?;
    Ok(HttpResponse::Ok().json(response))
}

async fn list_classifications(
    user: AuthenticatedUser,
    service: web::Data<ClassificationService>,
) -> Result<HttpResponse, ClassifyError> {
    let results = service.list_results(user.id()).await?;
    Ok(HttpResponse::Ok().json(results))
}

async fn classification_statistics(
    user: AuthenticatedUser,
    service: web::Data<ClassificationService>,
) -> Result<HttpResponse, ClassifyError> {
    let stats = service.statistics(user.id()).await?;
    Ok(HttpResponse::Ok().json(stats))
}

async fn get_classification(
    user: AuthenticatedUser,
    service: web::Data<ClassificationService>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ClassifyError> {
    let result = service.get_result(user.id(), path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(result))
}

async fn correct_classification(
    user: AuthenticatedUser,
    service: web::Data<ClassificationService>,
    path: web::Path<Uuid>,
    request: web::Json<CorrectionRequest>,
) -> Result<HttpResponse, ClassifyError> {
    require_admin(&user, "correct a classification")?;
    let result = service
        .correct_result(user.id(), path.into_inner(), request.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(result))
}

async fn create_batch(
    user: AuthenticatedUser,
    service: web::Data<ClassificationService>,
    request: web::Json<CreateBatchRequest>,
) -> Result<HttpResponse, ClassifyError> {
    let batch = service.create_batch(user.id(), request.into_inner()).await?;
    Ok(HttpResponse::Created().json(batch))
}

async fn get_batch(
    user: AuthenticatedUser,
    service: web::Data<ClassificationService>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ClassifyError> {
    let batch = service.get_batch(user.id(), path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(batch))
}

async fn model_info(
    _user: AuthenticatedUser,
    service: web::Data<ClassificationService>,
) -> HttpResponse {
    HttpResponse::Ok().json(service.model_info())
}

async fn reload_model(
    user: AuthenticatedUser,
    service: web::Data<ClassificationService>,
) -> Result<HttpResponse, ClassifyError> {
    require_admin(&user, "reload the model")?;
    let info = service.reload_model().await?;
    Ok(HttpResponse::Ok().json(info))
}

async fn switch_model(
    user: AuthenticatedUser,
    service: web::Data<ClassificationService>,
    request: web::Json<SwitchModelRequest>,
) -> Result<HttpResponse, ClassifyError> {
    require_admin(&user, "switch the model")?;
    let info = service.switch_model(&request.file).await?;
    Ok(HttpResponse::Ok().json(info))
}

fn require_admin(user: &AuthenticatedUser, action: &str) -> Result<(), ClassifyError> {
    if user.0.is_admin() {
        return Ok(());
    }
    log::warn!("User {} tried to {} without admin role", user.id(), action);
    Err(ClassifyError::Forbidden)
}
