//! Common test utilities for ovn-idl integration tests

#![allow(dead_code)]

use std::{
    sync::{Arc, Once},
    time::Duration,
};

use ovn_idl::{
    DatabaseSchema, Endpoint, MemoryEngine, MemoryServer, OvnConfig, OvnNbIdl, OvnSbIdl,
    RetryPolicy, Value,
};
use serde_json::json;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

pub const NB_REMOTE: &str = "tcp:127.0.0.1:6641";
pub const SB_REMOTE: &str = "tcp:127.0.0.1:6642";

static INIT: Once = Once::new();

/// Initialize test logging infrastructure
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

fn map_column() -> serde_json::Value {
    json!({"type": {"key": "string", "value": "string", "min": 0, "max": "unlimited"}})
}

fn string_set() -> serde_json::Value {
    json!({"type": {"key": "string", "min": 0, "max": "unlimited"}})
}

fn uuid_set(ref_table: &str) -> serde_json::Value {
    json!({"type": {"key": {"type": "uuid", "refTable": ref_table},
                    "min": 0, "max": "unlimited"}})
}

pub fn nb_schema() -> DatabaseSchema {
    DatabaseSchema::from_value(json!({
        "name": "OVN_Northbound",
        "version": "7.3.0",
        "tables": {
            "NB_Global": {
                "columns": {
                    "nb_cfg": {"type": {"key": "integer"}},
                    "options": map_column()
                },
                "isRoot": true
            },
            "Load_Balancer": {
                "columns": {
                    "name": {"type": "string"},
                    "vips": map_column(),
                    "ip_port_mappings": map_column(),
                    "health_check": uuid_set("Load_Balancer_Health_Check"),
                    "external_ids": map_column()
                },
                "isRoot": true
            },
            "Load_Balancer_Health_Check": {
                "columns": {
                    "vip": {"type": "string"},
                    "options": map_column()
                }
            },
            "Logical_Router": {
                "columns": {
                    "name": {"type": "string"},
                    "load_balancer": uuid_set("Load_Balancer"),
                    "ports": uuid_set("Logical_Router_Port")
                },
                "isRoot": true
            },
            "Logical_Switch": {
                "columns": {
                    "name": {"type": "string"},
                    "load_balancer": uuid_set("Load_Balancer"),
                    "ports": uuid_set("Logical_Switch_Port")
                },
                "isRoot": true
            },
            "Logical_Switch_Port": {
                "columns": {"name": {"type": "string"}, "addresses": string_set()}
            },
            "Logical_Router_Port": {
                "columns": {"name": {"type": "string"}, "networks": string_set()}
            },
            "NAT": {
                "columns": {"external_ip": {"type": "string"}, "logical_ip": {"type": "string"}}
            },
            "ACL": {
                "columns": {"priority": {"type": "integer"}, "action": {"type": "string"}}
            }
        }
    }))
    .unwrap()
}

pub fn sb_schema() -> DatabaseSchema {
    DatabaseSchema::from_value(json!({
        "name": "OVN_Southbound",
        "version": "20.33.0",
        "tables": {
            "Load_Balancer": {
                "columns": {"name": {"type": "string"}, "vips": map_column()},
                "isRoot": true
            },
            "Service_Monitor": {
                "columns": {
                    "ip": {"type": "string"},
                    "port": {"type": "integer"},
                    "logical_port": {"type": "string"},
                    "status": {"type": {"key": "string", "min": 0, "max": 1}}
                },
                "isRoot": true
            },
            "Chassis": {
                "columns": {"name": {"type": "string"}},
                "isRoot": true
            }
        }
    }))
    .unwrap()
}

/// Config with retry timings scaled down to milliseconds.
pub fn fast_config() -> OvnConfig {
    OvnConfig {
        ovsdb_connection_timeout_secs: 5,
        bootstrap_retry: RetryPolicy {
            initial_interval_ms: 5,
            max_interval_ms: 50,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_ms: None,
        },
        row_retry: RetryPolicy {
            initial_interval_ms: 10,
            max_interval_ms: 100,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_ms: Some(500),
        },
        ..Default::default()
    }
}

pub fn endpoint(remote: &str) -> Endpoint {
    Endpoint::parse(remote).unwrap()
}

/// Engine with a northbound server seeded with its `NB_Global` row.
pub fn nb_fixture() -> (Arc<MemoryEngine>, MemoryServer) {
    init_test_logging();
    let server = MemoryServer::new(nb_schema());
    server
        .insert_row("NB_Global", [("nb_cfg", Value::from(0i64))])
        .unwrap();
    let engine = Arc::new(MemoryEngine::new());
    engine.add_server(&endpoint(NB_REMOTE), server.clone());
    (engine, server)
}

pub fn add_sb_server(engine: &MemoryEngine) -> MemoryServer {
    let server = MemoryServer::new(sb_schema());
    engine.add_server(&endpoint(SB_REMOTE), server.clone());
    server
}

pub async fn nb_idl(engine: &Arc<MemoryEngine>, lock_name: Option<&str>) -> OvnNbIdl {
    OvnNbIdl::connect(engine.clone(), &fast_config(), lock_name)
        .await
        .unwrap()
}

pub async fn sb_idl(engine: &Arc<MemoryEngine>, lock_name: Option<&str>) -> OvnSbIdl {
    OvnSbIdl::connect(engine.clone(), &fast_config(), lock_name)
        .await
        .unwrap()
}

pub fn nb_cfg(server: &MemoryServer) -> i64 {
    server
        .rows("NB_Global")
        .first()
        .and_then(|row| row.get("nb_cfg"))
        .and_then(Value::as_integer)
        .unwrap()
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
