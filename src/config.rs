use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 全局配置单例
static CONFIG: OnceCell<AppConfig> = OnceCell::new();

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "ServerConfig::default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,
}

impl ServerConfig {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }
    fn default_port() -> u16 {
        8080
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别（`RUST_LOG` 存在时以其为准）
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
    /// 日志格式：json（默认，适合采集）| pretty（本地开发）
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
    fn default_format() -> String {
        "json".to_string()
    }

    pub fn is_json(&self) -> bool {
        !self.format.eq_ignore_ascii_case("pretty")
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: Self::default_format(),
        }
    }
}

/// API 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API 路由前缀
    #[serde(default = "ApiConfig::default_prefix")]
    pub prefix: String,
}

impl ApiConfig {
    fn default_prefix() -> String {
        "/v1".to_string()
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            prefix: Self::default_prefix(),
        }
    }
}

/// CORS 配置（默认放行本地前端开发服务器）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// 是否启用 CORS
    #[serde(default = "CorsConfig::default_enabled")]
    pub enabled: bool,
    /// 允许的 Origin 列表（支持 "*" 表示任意）
    #[serde(default = "CorsConfig::default_origins")]
    pub allowed_origins: Vec<String>,
    /// 允许的方法列表（支持 "*" 表示任意）
    #[serde(default = "CorsConfig::default_methods")]
    pub allowed_methods: Vec<String>,
    /// 允许的请求头列表（支持 "*" 表示任意）
    #[serde(default = "CorsConfig::default_headers")]
    pub allowed_headers: Vec<String>,
    /// 暴露的响应头列表（前端需要读取 X-Cache / X-Request-ID）
    #[serde(default = "CorsConfig::default_expose_headers")]
    pub expose_headers: Vec<String>,
    /// 是否允许携带凭证（Cookie/Authorization）
    #[serde(default = "CorsConfig::default_allow_credentials")]
    pub allow_credentials: bool,
    /// 预检缓存时间（秒）
    #[serde(default)]
    pub max_age_secs: Option<u64>,
}

impl CorsConfig {
    fn default_enabled() -> bool {
        true
    }
    fn default_origins() -> Vec<String> {
        vec!["http://localhost:5173".to_string()]
    }
    fn default_methods() -> Vec<String> {
        ["GET", "POST", "OPTIONS"].map(String::from).to_vec()
    }
    fn default_headers() -> Vec<String> {
        ["X-Cache", "Content-Type", "Authorization"]
            .map(String::from)
            .to_vec()
    }
    fn default_expose_headers() -> Vec<String> {
        ["X-Cache", "X-Request-ID"].map(String::from).to_vec()
    }
    fn default_allow_credentials() -> bool {
        true
    }

    /// 全部字段清空的关闭态，测试中按需覆盖
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            allowed_origins: Vec::new(),
            allowed_methods: Vec::new(),
            allowed_headers: Vec::new(),
            expose_headers: Vec::new(),
            allow_credentials: false,
            max_age_secs: None,
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            allowed_origins: Self::default_origins(),
            allowed_methods: Self::default_methods(),
            allowed_headers: Self::default_headers(),
            expose_headers: Self::default_expose_headers(),
            allow_credentials: Self::default_allow_credentials(),
            max_age_secs: None,
        }
    }
}

/// 转换线程池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// 工作线程数（0=自动，取 CPU 核心数）
    #[serde(default = "PoolConfig::default_workers")]
    pub workers: usize,
    /// 等待队列容量；队列满时提交方会被挂起（背压）
    #[serde(default = "PoolConfig::default_queue_capacity")]
    pub queue_capacity: usize,
}

impl PoolConfig {
    fn default_workers() -> usize {
        5
    }
    fn default_queue_capacity() -> usize {
        100
    }

    /// 实际启动的工作线程数
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: Self::default_workers(),
            queue_capacity: Self::default_queue_capacity(),
        }
    }
}

/// 结果缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 是否启用结果缓存（关闭后所有查询都视为未命中）
    #[serde(default = "CacheConfig::default_enabled")]
    pub enabled: bool,
    /// 条目存活时间（秒）
    #[serde(default = "CacheConfig::default_ttl")]
    pub ttl_secs: u64,
    /// 容量上限（按缓存文本的总字节数加权）
    #[serde(default = "CacheConfig::default_max_bytes")]
    pub max_bytes: u64,
}

impl CacheConfig {
    fn default_enabled() -> bool {
        true
    }
    fn default_ttl() -> u64 {
        24 * 60 * 60
    }
    fn default_max_bytes() -> u64 {
        256 * 1024 * 1024
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            ttl_secs: Self::default_ttl(),
            max_bytes: Self::default_max_bytes(),
        }
    }
}

/// 转换请求配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertConfig {
    /// 未指定 width 时的默认列数
    #[serde(default = "ConvertConfig::default_width")]
    pub default_width: u32,
    /// width 参数上限
    #[serde(default = "ConvertConfig::default_max_dim")]
    pub max_width: u32,
    /// height 参数上限
    #[serde(default = "ConvertConfig::default_max_dim")]
    pub max_height: u32,
    /// 单图转换等待上限（秒），超时返回“服务繁忙”
    #[serde(default = "ConvertConfig::default_timeout")]
    pub timeout_secs: u64,
    /// 上传体积上限（字节）
    #[serde(default = "ConvertConfig::default_max_upload")]
    pub max_upload_bytes: usize,
    /// 解码画布边长上限（像素）
    #[serde(default = "ConvertConfig::default_max_image_dimension")]
    pub max_image_dimension: u32,
    /// 解码像素总字节上限（动图为全部帧合计）
    #[serde(default = "ConvertConfig::default_max_decoded_bytes")]
    pub max_decoded_bytes: u64,
    /// 动图帧数上限
    #[serde(default = "ConvertConfig::default_max_frames")]
    pub max_frames: usize,
}

impl ConvertConfig {
    fn default_width() -> u32 {
        180
    }
    fn default_max_dim() -> u32 {
        1000
    }
    fn default_timeout() -> u64 {
        10
    }
    fn default_max_upload() -> usize {
        20 * 1024 * 1024
    }
    fn default_max_image_dimension() -> u32 {
        4096
    }
    fn default_max_decoded_bytes() -> u64 {
        256 * 1024 * 1024
    }
    fn default_max_frames() -> usize {
        1000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            default_width: Self::default_width(),
            max_width: Self::default_max_dim(),
            max_height: Self::default_max_dim(),
            timeout_secs: Self::default_timeout(),
            max_upload_bytes: Self::default_max_upload(),
            max_image_dimension: Self::default_max_image_dimension(),
            max_decoded_bytes: Self::default_max_decoded_bytes(),
            max_frames: Self::default_max_frames(),
        }
    }
}

/// 优雅退出配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// 等待线程池排空的超时时间（秒）
    #[serde(default = "ShutdownConfig::default_timeout")]
    pub timeout_secs: u64,
}

impl ShutdownConfig {
    fn default_timeout() -> u64 {
        30
    }

    /// 获取优雅退出超时时间
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Self::default_timeout(),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// CORS 配置
    #[serde(default)]
    pub cors: CorsConfig,
    /// 转换线程池配置
    #[serde(default)]
    pub pool: PoolConfig,
    /// 结果缓存配置
    #[serde(default)]
    pub cache: CacheConfig,
    /// 转换请求配置
    #[serde(default)]
    pub convert: ConvertConfig,
    /// 优雅退出配置
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl AppConfig {
    /// 从配置文件加载配置（文件可缺省），支持环境变量覆盖
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path();

        let builder = ConfigBuilder::builder()
            .add_source(File::from(config_path).required(false))
            // 环境变量覆盖，例如：APP_SERVER__PORT=9000、APP_POOL__QUEUE_CAPACITY=200
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        builder.try_deserialize()
    }

    /// 获取全局配置单例
    pub fn global() -> &'static AppConfig {
        CONFIG.get().expect("配置未初始化，请先调用 init_global()")
    }

    /// 初始化全局配置
    pub fn init_global() -> Result<(), ConfigError> {
        let config = Self::load()?;
        CONFIG
            .set(config)
            .map_err(|_| ConfigError::Message("配置已经被初始化".to_string()))?;
        Ok(())
    }

    /// 获取配置文件路径（可通过 APP_CONFIG_FILE 指定）
    fn get_config_path() -> PathBuf {
        std::env::var("APP_CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"))
    }

    /// 获取服务器监听地址
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
