use nimbus_scheduler::catalog::Catalog;
use nimbus_scheduler::model::Pod;

pub fn pending_pod(name: &str, cpu: f64, mem: f64) -> Pod {
    Pod::new("default", name, cpu, mem)
}

pub fn test_catalog() -> Catalog {
    let spec_json = r#"{
        "us-east1": [
            {"name": "small-2cpu", "vcpus": 2, "mem_gib": 4.0},
            {"name": "medium-4cpu", "vcpus": 4, "mem_gib": 8.0}
        ]
    }"#;
    let price_json = r#"{
        "us-east1": {
            "OnDemand": {
                "small-2cpu": 0.01,
                "medium-4cpu": 0.018
            }
        }
    }"#;
    Catalog::from_json(spec_json, price_json).unwrap()
}
