use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct RedisArgs {
    #[arg(long, env = "REDIS_HOST", default_value = "127.0.0.1")]
    pub redis_host: String,

    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    #[arg(long, env = "REDIS_USERNAME")]
    pub redis_username: Option<String>,

    #[arg(long, env = "REDIS_PASSWORD")]
    pub redis_password: Option<String>,

    #[arg(long, env = "REDIS_PROTO", default_value = "redis")]
    pub redis_proto: String,
}

impl RedisArgs {
    pub fn url_redacted(&self) -> String {
        format!(
            "{}://{}:{}@{}:{}",
            if self.redis_proto.is_empty() {
                "redis"
            } else {
                &self.redis_proto
            },
            self.redis_username.as_deref().unwrap_or(""),
            self.redis_password.as_deref().map(|_| "****").unwrap_or(""),
            self.redis_host,
            self.redis_port
        )
    }

    pub fn url(&self) -> String {
        let proto = if self.redis_proto.is_empty() {
            "redis"
        } else {
            &self.redis_proto
        };
        let mut url = format!("{}://", proto);
        if let Some(ref username) = self.redis_username {
            url.push_str(username);
            if let Some(ref password) = self.redis_password {
                url.push(':');
                url.push_str(password);
            }
            url.push('@');
        } else if let Some(ref password) = self.redis_password {
            url.push(':');
            url.push_str(password);
            url.push('@');
        }
        url.push_str(&format!("{}:{}/", self.redis_host, self.redis_port));
        url
    }
}

/// S3-compatible blob bucket holding tile snapshots. The endpoint override
/// lets this point at R2 or a local emulator.
#[derive(Parser, Debug, Clone)]
pub struct BlobStoreArgs {
    #[arg(long, env = "BLOB_BUCKET")]
    pub blob_bucket: Option<String>,

    #[arg(long, env = "BLOB_REGION", default_value = "auto")]
    pub blob_region: String,

    #[arg(long, env = "BLOB_ENDPOINT")]
    pub blob_endpoint: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct TokenArgs {
    /// HMAC secret for identity tokens. Every instance must share it.
    #[arg(long, env = "TOKEN_SECRET", required = true)]
    pub token_secret: String,
}
