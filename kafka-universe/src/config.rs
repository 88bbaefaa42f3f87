use envconfig::Envconfig;

/// Process configuration of the `kafka-universe` runner.
#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    /// JSON array of cluster definitions
    #[envconfig(default = "universe.json")]
    pub universe_config_path: String,

    #[envconfig(default = "")]
    pub secret_env_prefix: String,

    // Comma separated ids, empty means all of them
    #[envconfig(default = "")]
    pub consumers: String,

    #[envconfig(default = "")]
    pub producers: String,

    #[envconfig(default = "false")]
    pub decode_base64: bool,

    #[envconfig(default = "false")]
    pub log_json: bool,
}

impl Config {
    pub fn consumer_ids(&self) -> Vec<&str> {
        split_ids(&self.consumers)
    }

    pub fn producer_ids(&self) -> Vec<&str> {
        split_ids(&self.producers)
    }
}

fn split_ids(value: &str) -> Vec<&str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .collect()
}
