use extendeddaemonset::crd::extended_daemon_set::ExtendedDaemonSet;
use extendeddaemonset::crd::replica_set::ExtendedDaemonSetReplicaSet;
use extendeddaemonset::crd::setting::ExtendedDaemonsetSetting;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    // Prints the three CRDs as a JSON list; pipe through a YAML converter
    // to produce manifests:
    // cargo run --bin gen-crd | python3 -c "import sys,json,yaml; print(yaml.dump_all(json.load(sys.stdin), default_flow_style=False))"
    let crds = vec![
        serde_json::to_value(ExtendedDaemonSet::crd())?,
        serde_json::to_value(ExtendedDaemonSetReplicaSet::crd())?,
        serde_json::to_value(ExtendedDaemonsetSetting::crd())?,
    ];

    println!("{}", serde_json::to_string_pretty(&crds)?);
    Ok(())
}
