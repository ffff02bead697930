use super::*;

use std::sync::Arc;

use semver::Version;

fn leaf(name: &str) -> Arc<PackageSpec> {
    SpecBuilder::new(name)
        .version(Version::new(1, 0, 0))
        .build()
        .expect("must build")
}

#[test]
fn depflag_set_operations() {
    let linkrun = DepFlag::LINK | DepFlag::RUN;
    assert!(linkrun.contains(DepFlag::LINK));
    assert!(linkrun.contains(DepFlag::RUN));
    assert!(!linkrun.contains(DepFlag::BUILD));
    assert!(linkrun.intersects(DepFlag::RUN | DepFlag::TEST));
    assert!(!linkrun.intersects(DepFlag::TEST));
    assert!(DepFlag::NONE.is_empty());
    assert_eq!((linkrun & DepFlag::RUN), DepFlag::RUN);
    assert_eq!(linkrun.to_string(), "link+run");
}

#[test]
fn same_subtree_hashes_identically() {
    let dep = leaf("zlib");
    let a = SpecBuilder::new("curl")
        .version(Version::new(8, 0, 0))
        .depends_on(Arc::clone(&dep), DepFlag::LINK)
        .build()
        .expect("must build");
    let b = SpecBuilder::new("curl")
        .version(Version::new(8, 0, 0))
        .depends_on(Arc::clone(&dep), DepFlag::LINK)
        .build()
        .expect("must build");
    assert_eq!(a.dag_hash(), b.dag_hash());
    assert_eq!(package_id(&a), package_id(&b));
}

#[test]
fn depflag_changes_the_hash() {
    let dep = leaf("zlib");
    let linked = SpecBuilder::new("curl")
        .depends_on(Arc::clone(&dep), DepFlag::LINK)
        .build()
        .expect("must build");
    let built = SpecBuilder::new("curl")
        .depends_on(Arc::clone(&dep), DepFlag::BUILD)
        .build()
        .expect("must build");
    assert_ne!(linked.dag_hash(), built.dag_hash());
}

#[test]
fn abstract_spec_is_not_concrete() {
    let spec = SpecBuilder::new("curl").build_abstract();
    assert!(!spec.is_concrete());
    assert!(spec.dag_hash().is_empty());
}

#[test]
fn builder_rejects_abstract_dependency() {
    let dep = SpecBuilder::new("zlib").build_abstract();
    let err = SpecBuilder::new("curl")
        .depends_on(dep, DepFlag::LINK)
        .build()
        .expect_err("must reject");
    assert!(err.to_string().contains("not concrete"));
}

#[test]
fn builder_rejects_duplicate_edges() {
    let dep = leaf("zlib");
    let err = SpecBuilder::new("curl")
        .depends_on(Arc::clone(&dep), DepFlag::LINK)
        .depends_on(dep, DepFlag::RUN)
        .build()
        .expect_err("must reject");
    assert!(err.to_string().contains("duplicate dependency edge"));
}

#[test]
fn traversal_is_post_order_and_deduplicated() {
    // a -> {b, c}, b -> d, c -> d: the diamond from the scheduler scenarios.
    let d = leaf("d");
    let b = SpecBuilder::new("b")
        .depends_on(Arc::clone(&d), DepFlag::LINK)
        .build()
        .expect("must build");
    let c = SpecBuilder::new("c")
        .depends_on(Arc::clone(&d), DepFlag::LINK)
        .build()
        .expect("must build");
    let a = SpecBuilder::new("a")
        .depends_on(Arc::clone(&b), DepFlag::LINK)
        .depends_on(Arc::clone(&c), DepFlag::LINK)
        .build()
        .expect("must build");

    let order: Vec<String> = a
        .traverse_dependencies(|_| DepFlag::ALL)
        .iter()
        .map(|s| s.name().to_string())
        .collect();
    assert_eq!(order.len(), 3, "shared dep must appear once");
    let pos = |n: &str| order.iter().position(|x| x == n).expect("present");
    assert!(pos("d") < pos("b"));
    assert!(pos("d") < pos("c"));
    assert!(!order.contains(&"a".to_string()));
}

#[test]
fn traversal_honors_per_node_depflags() {
    let testdep = leaf("check");
    let lib = SpecBuilder::new("lib")
        .depends_on(Arc::clone(&testdep), DepFlag::TEST)
        .build()
        .expect("must build");
    let app = SpecBuilder::new("app")
        .depends_on(Arc::clone(&lib), DepFlag::LINK)
        .build()
        .expect("must build");

    // Tests requested only for "app": lib's test-only dep stays out.
    let names: Vec<String> = app
        .traverse_dependencies(|spec| {
            let mut flags = DepFlag::LINK | DepFlag::RUN;
            if spec.name() == "app" {
                flags |= DepFlag::TEST;
            }
            flags
        })
        .iter()
        .map(|s| s.name().to_string())
        .collect();
    assert_eq!(names, vec!["lib"]);

    // Tests requested everywhere: the test dep comes in under lib.
    let names: Vec<String> = app
        .traverse_dependencies(|_| DepFlag::LINK | DepFlag::RUN | DepFlag::TEST)
        .iter()
        .map(|s| s.name().to_string())
        .collect();
    assert_eq!(names, vec!["check", "lib"]);
}

#[test]
fn external_and_upstream_markers() {
    let ext = SpecBuilder::new("openssl")
        .external("/usr")
        .build()
        .expect("must build");
    assert!(ext.external());
    assert_eq!(ext.external_path().map(|p| p.display().to_string()), Some("/usr".to_string()));

    let upstream = SpecBuilder::new("mpich")
        .installed_upstream()
        .build()
        .expect("must build");
    assert!(upstream.installed_upstream());
}
