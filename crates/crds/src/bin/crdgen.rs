//! Prints the KluctlDeployment CRD as YAML
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crd/kluctl-deployment.yaml`

use crds::KluctlDeployment;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crd = serde_yaml::to_string(&KluctlDeployment::crd())?;
    print!("{}", crd);
    Ok(())
}
