use utoipa::openapi::server::{ServerBuilder, ServerVariableBuilder};
use utoipa::{Modify, OpenApi};

/// OpenAPI 的 paths 不含路由前缀，这里通过 servers 变量补上。
struct ApiServers;

impl Modify for ApiServers {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let api = ServerBuilder::new()
            .url("{api_prefix}")
            .description(Some("业务接口（默认 /v1）"))
            .parameter(
                "api_prefix",
                ServerVariableBuilder::new()
                    .default_value("/v1")
                    .description(Some(
                        "接口前缀：对应 config.api.prefix（可通过 APP_API__PREFIX 覆盖）",
                    )),
            )
            .build();
        openapi.servers = Some(vec![api]);
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::features::health::handler::health_check,
        crate::features::convert::handler::convert_image,
        crate::features::convert::handler::stream_animation,
    ),
    components(schemas(
        crate::error::ProblemDetails,
        crate::features::health::HealthResponse,
        crate::features::art::RenderMode,
        crate::features::convert::ImageUpload,
    )),
    modifiers(&ApiServers),
    tags(
        (
            name = "Convert",
            description = "字符画转换：静态图一次性返回，动图按帧序逐帧推送。"
        ),
        (name = "Health", description = "健康检查：服务探活。"),
    ),
    info(
        title = "Rune Engine API",
        version = env!("CARGO_PKG_VERSION"),
        description = "图片转字符画服务（Axum + utoipa）。业务接口实际挂载在 `config.api.prefix`（默认 /v1）下。"
    )
)]
pub struct ApiDoc;
