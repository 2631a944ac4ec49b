use redis::{aio::MultiplexedConnection, Client};

// Удаляем ключ только если он всё ещё наш: чужой токен значит, что TTL истёк
// и блокировку уже взял другой процесс.
const UNLOCK_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

#[derive(Clone)]
pub struct RedisClient {
    pub conn: MultiplexedConnection,
}

impl RedisClient {
    pub async fn new(redis_url: &str) -> redis::RedisResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(RedisClient { conn })
    }

    /// SET key token NX PX ttl. `true`, если блокировка взята.
    pub async fn try_lock(&self, key: &str, token: &str, ttl_ms: u64) -> redis::RedisResult<bool> {
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX") // только если ключа нет
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    /// Снимает блокировку, если она всё ещё принадлежит `token`.
    pub async fn unlock(&self, key: &str, token: &str) -> redis::RedisResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i32 = redis::Script::new(UNLOCK_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}
