use alpine_operator::Alpine;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(&Alpine::crd())?;
    print!("{yaml}");
    Ok(())
}
