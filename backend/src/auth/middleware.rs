use super::jwt::JwtService;
use super::models::Principal;
use actix_web::{
    Error, HttpMessage, HttpResponse,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
};
use actix_web::{FromRequest, HttpRequest};
use futures::future::{Ready, err, ok};
use shared::ErrorResponse;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct AuthMiddleware {
    jwt_service: Arc<JwtService>,
}

impl AuthMiddleware {
    pub fn new(jwt_service: JwtService) -> Self {
        Self {
            jwt_service: Arc::new(jwt_service),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for AuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<actix_web::body::EitherBody<B>>;
    type Error = Error;
    type Transform = AuthMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthMiddlewareService {
            service: Arc::new(service),
            jwt_service: self.jwt_service.clone(),
        })
    }
}

pub struct AuthMiddlewareService<S> {
    service: Arc<S>,
    jwt_service: Arc<JwtService>,
}

#[derive(Debug)]
enum AuthError {
    NoAuthHeader,
    InvalidHeaderFormat,
    NotBearerToken,
    VerificationFailed(String),
    InvalidUuidInClaims(String),
}

impl AuthError {
    fn log_message(&self, path: &str) -> String {
        match self {
            AuthError::NoAuthHeader => format!("No Authorization header found for path: {}", path),
            AuthError::InvalidHeaderFormat => format!("Invalid Authorization header format (non-UTF-8) for path: {}", path),
            AuthError::NotBearerToken => format!("Authorization header for path {} doesn't start with 'Bearer '", path),
            AuthError::VerificationFailed(e) => format!("JWT token verification failed for path {}: {}", path, e),
            AuthError::InvalidUuidInClaims(sub) => format!("Invalid UUID in JWT claims.sub for path {}: {}", path, sub),
        }
    }

    fn client_error(&self) -> ErrorResponse {
        let error_message = match self {
            AuthError::InvalidUuidInClaims(_) => "Invalid token claims",
            AuthError::VerificationFailed(_) => "Token verification failed",
            _ => "Missing or invalid authorization token",
        };
        ErrorResponse {
            error: error_message.to_string(),
            kind: "unauthorized".to_string(),
            reason: None,
            prediction: None,
        }
    }
}

fn validate_request_token(
    req: &ServiceRequest,
    jwt_service: &JwtService,
) -> Result<Principal, AuthError> {
    let auth_header = req.headers().get("Authorization").ok_or(AuthError::NoAuthHeader)?;
    let auth_str = auth_header.to_str().map_err(|_| AuthError::InvalidHeaderFormat)?;
    let token = auth_str.strip_prefix("Bearer ").ok_or(AuthError::NotBearerToken)?;

    let claims = jwt_service
        .verify_token(token)
        .map_err(|e| AuthError::VerificationFailed(e.to_string()))?;

    log::debug!("JWT token verified for user: {}", claims.sub);
    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| AuthError::InvalidUuidInClaims(claims.sub.clone()))?;
    Ok(Principal {
        user_id,
        role: claims.role,
    })
}

impl<S, B> Service<ServiceRequest> for AuthMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<actix_web::body::EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let jwt_service = self.jwt_service.clone();

        Box::pin(async move {
            let path_str = req.path().to_string();

            match validate_request_token(&req, &jwt_service) {
                Ok(principal) => {
                    req.extensions_mut().insert(principal);
                    let res = service.call(req).await?;
                    Ok(res.map_into_left_body())
                }
                Err(auth_error) => {
                    log::warn!("{}", auth_error.log_message(&path_str));

                    let (http_req, _payload) = req.into_parts();
                    let response = HttpResponse::Unauthorized()
                        .json(auth_error.client_error())
                        .map_into_right_body();
                    Ok(ServiceResponse::new(http_req, response))
                }
            }
        })
    }
}

/// The caller behind a verified token.
pub struct AuthenticatedUser(pub Principal);

impl AuthenticatedUser {
    pub fn id(&self) -> Uuid {
        self.0.user_id
    }
}

impl FromRequest for AuthenticatedUser {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        match req.extensions().get::<Principal>() {
            Some(principal) => ok(AuthenticatedUser(*principal)),
            None => {
                log::warn!("No authenticated principal for path: {}", req.path());
                err(actix_web::error::ErrorUnauthorized("authentication required"))
            }
        }
    }
}
