use envconfig::Envconfig;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3000")]
    pub port: u16,

    #[envconfig(default = "redis://127.0.0.1:6379/0")]
    pub redis_url: String,

    #[envconfig(default = "webhooks")]
    pub queue_name: String,

    #[envconfig(default = "1000000")]
    pub max_body_size: usize,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
