//! Device presence and command dispatch (spec §4.4).
//!
//! Redis holds the hot path: the IMEI allow-list (a `SET`) and the latest device status (a
//! `HASH`), both rebuilt from Postgres periodically so a Redis flush only costs staleness,
//! never correctness. Postgres is the durable source of truth for the command queue; Redis
//! mirrors it as a per-IMEI `LIST` so the session supervisor never blocks on a database
//! round trip while draining commands after a device checks in.

pub mod command_queue;

use std::collections::HashMap;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::PgPool;

use crate::protocol::DeviceRecord;

const ALLOWLIST_KEY: &str = "gateway:allowlist";

fn status_key(imei: &str) -> String {
    format!("gateway:status:{}", imei)
}

/// `DeviceStatus.status`, per spec §3.
pub const CONNECTED: &str = "CONNECTED";
pub const DISCONNECTED: &str = "DISCONNECTED";

/// Device status as last reported, mirrored into the `device_status` field-wise merge
/// HASH so a HEARTBEAT doesn't clobber the last known location and vice versa.
#[derive(Debug, Clone, Default)]
pub struct DeviceStatus {
    pub protocol: Option<String>,
    pub status: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub course_deg: Option<f64>,
    pub battery_level: Option<u8>,
    pub acc: Option<bool>,
    pub satellites: Option<u8>,
}

#[derive(Debug)]
pub enum PresenceError {
    Redis(redis::RedisError),
    Sql(sqlx::Error),
}

impl From<redis::RedisError> for PresenceError {
    fn from(error: redis::RedisError) -> Self {
        PresenceError::Redis(error)
    }
}

impl From<sqlx::Error> for PresenceError {
    fn from(error: sqlx::Error) -> Self {
        PresenceError::Sql(error)
    }
}

#[derive(Clone)]
pub struct PresenceStore {
    redis: ConnectionManager,
    db: PgPool,
}

impl PresenceStore {
    pub fn new(redis: ConnectionManager, db: PgPool) -> Self {
        PresenceStore { redis, db }
    }

    /// Checks the IMEI allow-list (spec §4.3, "authorization gate").
    pub async fn is_authorized(&self, imei: &str) -> Result<bool, PresenceError> {
        let mut conn = self.redis.clone();
        Ok(conn.sismember(ALLOWLIST_KEY, imei).await?)
    }

    /// Rebuilds the allow-list `SET` from the `devices` table. Run on startup and by the
    /// periodic sync task; safe to call concurrently since it only ever grows monotonically
    /// within a single rebuild and is idempotent across rebuilds.
    pub async fn sync_allowlist(&self) -> Result<(), PresenceError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT imei FROM devices").fetch_all(&self.db).await?;
        let mut conn = self.redis.clone();
        for (imei,) in rows {
            let _: () = conn.sadd(ALLOWLIST_KEY, imei).await?;
        }
        Ok(())
    }

    /// Field-wise merges a decoded record's location/status fields into the device's status
    /// HASH, and marks it CONNECTED. A HEARTBEAT with no location does not erase the last
    /// known fix (spec §3, §4.3 step 6).
    pub async fn upsert_status(&self, record: &DeviceRecord) -> Result<(), PresenceError> {
        let mut conn = self.redis.clone();
        let key = status_key(&record.imei);
        let mut fields: Vec<(&str, String)> = vec![
            ("protocol", format!("{:?}", record.protocol).to_lowercase()),
            ("status", CONNECTED.to_string()),
        ];

        if let Some(location) = &record.location {
            fields.push(("lat", location.lat.to_string()));
            fields.push(("lon", location.lon.to_string()));
            fields.push(("speed_kmh", location.speed_kmh.to_string()));
            fields.push(("course_deg", location.course_deg.to_string()));
            fields.push(("satellites", location.satellites.to_string()));
        }
        if let Some(status) = &record.status
            && let Some(battery) = status.battery_level
        {
            fields.push(("battery_level", battery.to_string()));
        }
        if let Some(sensors) = &record.sensors
            && let Some(crate::protocol::SensorValue::Number(acc)) = sensors.get("acc")
        {
            fields.push(("acc", (*acc != 0.0).to_string()));
        }

        let _: () = conn.hset_multiple(&key, &fields).await?;

        sqlx::query(
            r#"
            INSERT INTO devices (imei) VALUES ($1)
            ON CONFLICT (imei) DO NOTHING
            "#,
        )
        .bind(&record.imei)
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO device_status (imei, protocol, status, lat, lon, speed_kmh, course_deg, battery_level, acc, satellites, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (imei) DO UPDATE SET
                protocol = EXCLUDED.protocol,
                status = EXCLUDED.status,
                lat = COALESCE(EXCLUDED.lat, device_status.lat),
                lon = COALESCE(EXCLUDED.lon, device_status.lon),
                speed_kmh = COALESCE(EXCLUDED.speed_kmh, device_status.speed_kmh),
                course_deg = COALESCE(EXCLUDED.course_deg, device_status.course_deg),
                battery_level = COALESCE(EXCLUDED.battery_level, device_status.battery_level),
                acc = COALESCE(EXCLUDED.acc, device_status.acc),
                satellites = COALESCE(EXCLUDED.satellites, device_status.satellites),
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.imei)
        .bind(format!("{:?}", record.protocol).to_lowercase())
        .bind(CONNECTED)
        .bind(record.location.as_ref().map(|l| l.lat))
        .bind(record.location.as_ref().map(|l| l.lon))
        .bind(record.location.as_ref().map(|l| l.speed_kmh))
        .bind(record.location.as_ref().map(|l| l.course_deg))
        .bind(record.status.as_ref().and_then(|s| s.battery_level).map(|v| v as i16))
        .bind(record.sensors.as_ref().and_then(|s| match s.get("acc") {
            Some(crate::protocol::SensorValue::Number(acc)) => Some(*acc != 0.0),
            _ => None,
        }))
        .bind(record.location.as_ref().map(|l| l.satellites as i16))
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Transitions a device to DISCONNECTED on socket close/error (spec §3, §7). A no-op if
    /// the device never logged in (no row to transition).
    pub async fn mark_disconnected(&self, imei: &str) -> Result<(), PresenceError> {
        let mut conn = self.redis.clone();
        let _: () = conn.hset(status_key(imei), "status", DISCONNECTED).await?;

        sqlx::query("UPDATE device_status SET status = $1, updated_at = $2 WHERE imei = $3")
            .bind(DISCONNECTED)
            .bind(Utc::now())
            .bind(imei)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    /// Flushes every hot `DeviceStatus` entry cached in Redis back to SQL (spec §4.4's
    /// periodic background sync, third bullet). Devices that have never reported are absent
    /// from Redis and therefore untouched.
    pub async fn flush_status_to_sql(&self) -> Result<(), PresenceError> {
        let imeis: Vec<(String,)> = sqlx::query_as("SELECT imei FROM devices").fetch_all(&self.db).await?;
        for (imei,) in imeis {
            let Some(status) = self.get_status(&imei).await? else {
                continue;
            };
            sqlx::query(
                r#"
                INSERT INTO device_status (imei, protocol, status, lat, lon, speed_kmh, course_deg, battery_level, acc, satellites, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (imei) DO UPDATE SET
                    protocol = EXCLUDED.protocol,
                    status = EXCLUDED.status,
                    lat = EXCLUDED.lat,
                    lon = EXCLUDED.lon,
                    speed_kmh = EXCLUDED.speed_kmh,
                    course_deg = EXCLUDED.course_deg,
                    battery_level = EXCLUDED.battery_level,
                    acc = EXCLUDED.acc,
                    satellites = EXCLUDED.satellites,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&imei)
            .bind(status.protocol.unwrap_or_default())
            .bind(status.status.unwrap_or_else(|| DISCONNECTED.to_string()))
            .bind(status.lat)
            .bind(status.lon)
            .bind(status.speed_kmh)
            .bind(status.course_deg)
            .bind(status.battery_level.map(|v| v as i16))
            .bind(status.acc)
            .bind(status.satellites.map(|v| v as i16))
            .bind(Utc::now())
            .execute(&self.db)
            .await?;
        }
        Ok(())
    }

    /// Reads the last known status HASH for a device, if it has ever reported.
    pub async fn get_status(&self, imei: &str) -> Result<Option<DeviceStatus>, PresenceError> {
        let mut conn = self.redis.clone();
        let raw: HashMap<String, String> = conn.hgetall(status_key(imei)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(DeviceStatus {
            protocol: raw.get("protocol").cloned(),
            status: raw.get("status").cloned(),
            lat: raw.get("lat").and_then(|v| v.parse().ok()),
            lon: raw.get("lon").and_then(|v| v.parse().ok()),
            speed_kmh: raw.get("speed_kmh").and_then(|v| v.parse().ok()),
            course_deg: raw.get("course_deg").and_then(|v| v.parse().ok()),
            battery_level: raw.get("battery_level").and_then(|v| v.parse().ok()),
            acc: raw.get("acc").and_then(|v| v.parse().ok()),
            satellites: raw.get("satellites").and_then(|v| v.parse().ok()),
        }))
    }
}
