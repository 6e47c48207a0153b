use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub frontend_origin: Option<String>,
    pub session_max_ms: u64,
    pub warning_before_ms: u64,
    pub disconnect_grace_ms: u64,
    pub paying_grace_ms: u64,
    pub tip_currency: String,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub daily_room_url: Option<String>,
    pub daily_api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let frontend_origin = env::var("FRONTEND_ORIGIN")
            .ok()
            .map(|origin| origin.trim_end_matches('/').to_string())
            .filter(|origin| !origin.is_empty());

        Self {
            port: env::var("SNACK_COUNTER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(4000),
            frontend_origin,
            session_max_ms: env::var("SESSION_MAX_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10 * 60 * 1000),
            warning_before_ms: env::var("WARNING_BEFORE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60 * 1000),
            disconnect_grace_ms: env::var("DISCONNECT_GRACE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10 * 1000),
            paying_grace_ms: env::var("PAYING_GRACE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2 * 60 * 1000),
            tip_currency: env::var("TIP_CURRENCY").unwrap_or_else(|_| "jpy".to_string()),
            stripe_secret_key: env::var("STRIPE_SECRET_KEY").ok().filter(|k| !k.is_empty()),
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET")
                .ok()
                .filter(|k| !k.is_empty()),
            daily_room_url: env::var("DAILY_ROOM_URL").ok().filter(|u| !u.is_empty()),
            daily_api_key: env::var("DAILY_API_KEY").ok().filter(|k| !k.is_empty()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4000,
            frontend_origin: None,
            session_max_ms: 10 * 60 * 1000,
            warning_before_ms: 60 * 1000,
            disconnect_grace_ms: 10 * 1000,
            paying_grace_ms: 2 * 60 * 1000,
            tip_currency: "jpy".to_string(),
            stripe_secret_key: None,
            stripe_webhook_secret: None,
            daily_room_url: None,
            daily_api_key: None,
        }
    }
}
