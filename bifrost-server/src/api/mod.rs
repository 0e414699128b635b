use poem::Route;
use poem_openapi::{OpenApiService, Tags};

use crate::services::Services;

pub mod dispatch;
pub mod dto;
pub mod healthcheck;
pub mod pool;
pub mod reindex;
pub mod write;

#[derive(Tags)]
enum ApiTags {
    Write,
    Dispatch,
    Pool,
    Reindex,
    HealthCheck,
}

type ApiServices = (
    write::WriteApi,
    dispatch::DispatchApi,
    pool::PoolApi,
    reindex::ReindexApi,
    healthcheck::HealthcheckApi,
);

pub fn make_open_api_service(services: &std::sync::Arc<Services>) -> OpenApiService<ApiServices, ()> {
    OpenApiService::new(
        (
            write::WriteApi::new(services.clone()),
            dispatch::DispatchApi::new(services.clone()),
            pool::PoolApi::new(services.clone()),
            reindex::ReindexApi::new(services.clone()),
            healthcheck::HealthcheckApi,
        ),
        "Bifrost API",
        crate::VERSION,
    )
}

pub fn combined_routes(services: &std::sync::Arc<Services>) -> Route {
    let api_service = make_open_api_service(services);
    let ui = api_service.swagger_ui();
    let spec = api_service.spec_endpoint_yaml();

    Route::new().nest("/", api_service).nest("/docs", ui).nest("/specs", spec)
}
