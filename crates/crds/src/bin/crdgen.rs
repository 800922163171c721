//! Prints the CRD manifests as a multi-document YAML stream.
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crd/ipamnode.yaml`

use crds::IPAMNode;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crd = serde_yaml::to_string(&IPAMNode::crd())?;
    print!("---\n{crd}");
    Ok(())
}
