use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::rc::Rc;

use claw::errors::ClawError;
use claw::mapping::Mapping;
use claw::pool::Pools;
use claw::structs::Struct;
use claw::wire::{FieldType, Header};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct PodSchema {
    meta: Rc<Mapping>,
    port: Rc<Mapping>,
    container: Rc<Mapping>,
    spec: Rc<Mapping>,
    pod: Rc<Mapping>,
}

// A Kubernetes-flavoured schema, the canonical benchmark shape.
fn pod_schema() -> PodSchema {
    let meta = Mapping::builder("ObjectMeta")
        .field("name", FieldType::String)
        .field("generation", FieldType::Int64)
        .field("labels", FieldType::ListStrings)
        .build()
        .unwrap();

    let port = Mapping::builder("ContainerPort")
        .field("name", FieldType::String)
        .field("container_port", FieldType::Uint32)
        .build()
        .unwrap();

    let container = Mapping::builder("Container")
        .field("name", FieldType::String)
        .field("image", FieldType::String)
        .list_struct_field("ports", &port)
        .field("args", FieldType::ListStrings)
        .build()
        .unwrap();

    let spec = Mapping::builder("PodSpec")
        .list_struct_field("containers", &container)
        .field("node_name", FieldType::String)
        .field("active_deadline_seconds", FieldType::Int64)
        .build()
        .unwrap();

    let pod = Mapping::builder("Pod")
        .struct_field("metadata", &meta)
        .struct_field("spec", &spec)
        .field("ready", FieldType::Bool)
        .field("restart_counts", FieldType::ListUint32)
        .build()
        .unwrap();

    PodSchema {
        meta,
        port,
        container,
        spec,
        pod,
    }
}

/// Builds a populated Pod through the typed setters.
fn sample_pod(schema: &PodSchema, pools: &Pools) -> Struct {
    let pod = Struct::new(&schema.pod, pools);

    let meta = pod.new_struct(0).unwrap();
    meta.set_str(0, "web-frontend").unwrap();
    meta.set_i64(1, 3).unwrap();
    let labels = meta.new_list_strings(2).unwrap();
    labels.append("app=web").unwrap();
    labels.append("tier=frontend").unwrap();

    let spec = pod.new_struct(1).unwrap();
    spec.set_str(1, "node-7").unwrap();

    let containers = spec.new_list_structs(0).unwrap();
    for (name, image) in [("web", "nginx:1.24"), ("sidecar", "envoy:1.29")] {
        let container = Struct::new(&schema.container, pools);
        container.set_str(0, name).unwrap();
        container.set_str(1, image).unwrap();

        let http = Struct::new(&schema.port, pools);
        http.set_str(0, "http").unwrap();
        http.set_u32(1, 8080).unwrap();
        container.append_list_struct(2, http).unwrap();

        let args = container.new_list_strings(3).unwrap();
        args.append("--verbose").unwrap();

        containers.append(container).unwrap();
    }

    pod.set_bool(2, true).unwrap();
    let restarts = pod.new_list_numbers::<u32>(3).unwrap();
    for count in [0u32, 1, 4] {
        restarts.append(count).unwrap();
    }

    pod
}

#[test]
fn test_empty_pod_round_trip() {
    init_logs();
    let schema = pod_schema();
    let pools = Pools::new();

    assert_eq!(schema.spec.field_count(), 3);
    assert_eq!(schema.pod.field_count(), 4);

    let pod = Struct::new(&schema.pod, &pools);
    let mut buf = Vec::new();
    assert_eq!(pod.marshal(&mut buf).unwrap(), 8);

    let header = Header::unpack(&buf).unwrap();
    assert_eq!(header.field_num, 0);
    assert_eq!(header.field_type, FieldType::Struct);
    assert_eq!(header.final40, 8);

    let decoded = Struct::unmarshal_from(&schema.pod, &pools, &mut &buf[..]).unwrap();
    assert_eq!(decoded.wire_size(), 8);
    assert!(decoded.get_struct(0).unwrap().is_none());
    assert_eq!(decoded.get_bool(2).unwrap(), None);
}

#[test]
fn test_zero_scalars_and_empty_lists_are_omitted() {
    let schema = pod_schema();
    let pools = Pools::new();

    let pod = Struct::new(&schema.pod, &pools);
    pod.set_bool(2, false).unwrap();
    let meta = pod.new_struct(0).unwrap();
    meta.set_i64(1, 0).unwrap();
    meta.new_list_strings(2).unwrap();

    // A false bool, a zero int64 and an empty list cost nothing beyond the
    // empty nested struct itself.
    let mut buf = Vec::new();
    pod.marshal(&mut buf).unwrap();
    assert_eq!(buf.len(), 16);

    let decoded = Struct::unmarshal_from(&schema.pod, &pools, &mut &buf[..]).unwrap();
    let decoded_meta = decoded.get_struct(0).unwrap().unwrap();
    assert_eq!(decoded_meta.get_i64(1).unwrap(), None);
    // An empty list is indistinguishable from an absent one.
    assert!(decoded_meta.get_list_strings(2).unwrap().is_none());
}

#[test]
fn test_string_list_wire_layout() {
    let schema = pod_schema();
    let pools = Pools::new();

    let meta = Struct::new(&schema.meta, &pools);
    let labels = meta.new_list_strings(2).unwrap();
    labels.append("a").unwrap();
    labels.append("bb").unwrap();
    labels.append("ccc").unwrap();

    let mut buf = Vec::new();
    meta.marshal(&mut buf).unwrap();

    // list header + (4+1) + (4+2) + (4+3) = 26 payload bytes, padded to 32.
    assert_eq!(buf.len(), 8 + 32);

    let list_header = Header::unpack(&buf[8..]).unwrap();
    assert_eq!(list_header.field_num, 2);
    assert_eq!(list_header.field_type, FieldType::ListStrings);
    assert_eq!(list_header.final40, 3);
    assert_eq!(&buf[16..21], &[1, 0, 0, 0, b'a']);
    assert_eq!(&buf[34..], &[0u8; 6]);

    let decoded = Struct::unmarshal_from(&schema.meta, &pools, &mut &buf[..]).unwrap();
    let decoded_labels = decoded.get_list_strings(2).unwrap().unwrap();
    assert_eq!(
        decoded_labels.range(0, 3).unwrap(),
        vec!["a".to_string(), "bb".to_string(), "ccc".to_string()]
    );
}

#[test]
fn test_lazy_read_keeps_output_byte_identical() {
    init_logs();
    let schema = pod_schema();
    let pools = Pools::new();

    let original = {
        let pod = sample_pod(&schema, &pools);
        let mut buf = Vec::new();
        pod.marshal(&mut buf).unwrap();
        buf
    };

    let decoded = Struct::unmarshal_from(&schema.pod, &pools, &mut &original[..]).unwrap();

    // Read one leaf; everything else stays raw.
    let meta = decoded.get_struct(0).unwrap().unwrap();
    assert_eq!(meta.get_str(0).unwrap(), Some("web-frontend".to_string()));

    let mut re_emitted = Vec::new();
    decoded.marshal(&mut re_emitted).unwrap();
    assert_eq!(re_emitted, original);
}

#[test]
fn test_round_trip_identity_field_by_field() {
    let schema = pod_schema();
    let pools = Pools::new();

    let pod = sample_pod(&schema, &pools);
    let mut buf = Vec::new();
    pod.marshal(&mut buf).unwrap();

    let decoded = Struct::unmarshal_from(&schema.pod, &pools, &mut &buf[..]).unwrap();

    let meta = decoded.get_struct(0).unwrap().unwrap();
    assert_eq!(meta.get_str(0).unwrap(), Some("web-frontend".to_string()));
    assert_eq!(meta.get_i64(1).unwrap(), Some(3));
    let labels = meta.get_list_strings(2).unwrap().unwrap();
    assert_eq!(
        labels.range(0, labels.len()).unwrap(),
        vec!["app=web".to_string(), "tier=frontend".to_string()]
    );

    let spec = decoded.get_struct(1).unwrap().unwrap();
    assert_eq!(spec.get_str(1).unwrap(), Some("node-7".to_string()));
    assert_eq!(spec.get_i64(2).unwrap(), None);

    let containers = spec.get_list_structs(0).unwrap().unwrap();
    assert_eq!(containers.len(), 2);

    let sidecar = containers.get(1).unwrap();
    assert_eq!(sidecar.get_str(0).unwrap(), Some("sidecar".to_string()));
    assert_eq!(sidecar.get_str(1).unwrap(), Some("envoy:1.29".to_string()));

    let ports = sidecar.get_list_structs(2).unwrap().unwrap();
    assert_eq!(ports.len(), 1);
    let http = ports.get(0).unwrap();
    assert_eq!(http.get_str(0).unwrap(), Some("http".to_string()));
    assert_eq!(http.get_u32(1).unwrap(), Some(8080));

    assert_eq!(decoded.get_bool(2).unwrap(), Some(true));
    let restarts = decoded.get_list_numbers::<u32>(3).unwrap().unwrap();
    assert_eq!(restarts.range(0, 3).unwrap(), vec![0, 1, 4]);
}

#[test]
fn test_nested_mutation_propagates_one_delta() {
    init_logs();
    let schema = pod_schema();
    let pools = Pools::new();

    let original = {
        let pod = sample_pod(&schema, &pools);
        let mut buf = Vec::new();
        pod.marshal(&mut buf).unwrap();
        buf
    };

    let pod = Struct::unmarshal_from(&schema.pod, &pools, &mut &original[..]).unwrap();
    let spec = pod.get_struct(1).unwrap().unwrap();
    let containers = spec.get_list_structs(0).unwrap().unwrap();
    let container = containers.get(1).unwrap();

    let container_before = container.wire_size();
    let spec_before = spec.wire_size();
    let pod_before = pod.wire_size();

    // Different length, so a signed delta walks the whole chain.
    container.set_str(1, "envoy:1.29.2-distroless").unwrap();

    let delta = container.wire_size() as i64 - container_before as i64;
    assert_ne!(delta, 0);
    assert_eq!(spec.wire_size() as i64 - spec_before as i64, delta);
    assert_eq!(pod.wire_size() as i64 - pod_before as i64, delta);

    let mut mutated = Vec::new();
    pod.marshal(&mut mutated).unwrap();
    assert_eq!(mutated.len() as i64, original.len() as i64 + delta);

    let reread = Struct::unmarshal_from(&schema.pod, &pools, &mut &mutated[..]).unwrap();
    let reread_container = reread
        .get_struct(1)
        .unwrap()
        .unwrap()
        .get_list_structs(0)
        .unwrap()
        .unwrap()
        .get(1)
        .unwrap();
    assert_eq!(
        reread_container.get_str(1).unwrap(),
        Some("envoy:1.29.2-distroless".to_string())
    );
}

#[test]
fn test_same_length_mutation_is_local() {
    let schema = pod_schema();
    let pools = Pools::new();

    let original = {
        let pod = sample_pod(&schema, &pools);
        let mut buf = Vec::new();
        pod.marshal(&mut buf).unwrap();
        buf
    };

    let pod = Struct::unmarshal_from(&schema.pod, &pools, &mut &original[..]).unwrap();
    let meta_len = {
        let meta = pod.get_struct(0).unwrap().unwrap();
        meta.wire_size() as usize
    };

    let spec = pod.get_struct(1).unwrap().unwrap();
    let containers = spec.get_list_structs(0).unwrap().unwrap();
    let container = containers.get(0).unwrap();
    container.set_str(1, "nginx:1.25").unwrap(); // same length as nginx:1.24

    let mut mutated = Vec::new();
    pod.marshal(&mut mutated).unwrap();
    assert_eq!(mutated.len(), original.len());

    // Root header and the whole metadata field are untouched; only bytes
    // inside the spec field differ.
    assert_eq!(&mutated[..8 + meta_len], &original[..8 + meta_len]);
    assert_ne!(mutated, original);
}

#[test]
fn test_wire_size_matches_emitted_length_after_mutations() {
    let schema = pod_schema();
    let pools = Pools::new();
    let pod = sample_pod(&schema, &pools);

    let meta = pod.get_struct(0).unwrap().unwrap();
    meta.set_str(0, "renamed").unwrap();
    meta.delete(1).unwrap();
    pod.set_bool(2, false).unwrap();
    pod.get_list_numbers::<u32>(3)
        .unwrap()
        .unwrap()
        .append(9)
        .unwrap();

    let mut buf = Vec::new();
    let written = pod.marshal(&mut buf).unwrap();
    assert_eq!(written, pod.wire_size());
    assert_eq!(buf.len() as u64, written);
}

#[test]
fn test_self_referential_schema_round_trips() {
    let node = Mapping::builder("TreeNode")
        .field("value", FieldType::Int32)
        .self_list_struct_field("children")
        .build()
        .unwrap();
    let pools = Pools::new();

    let root = Struct::new(&node, &pools);
    root.set_i32(0, 1).unwrap();
    for value in [2, 3] {
        let child = Struct::new(&node, &pools);
        child.set_i32(0, value).unwrap();
        if value == 2 {
            let leaf = Struct::new(&node, &pools);
            leaf.set_i32(0, 4).unwrap();
            child.append_list_struct(1, leaf).unwrap();
        }
        root.append_list_struct(1, child).unwrap();
    }

    let mut buf = Vec::new();
    root.marshal(&mut buf).unwrap();

    let decoded = Struct::unmarshal_from(&node, &pools, &mut &buf[..]).unwrap();
    assert_eq!(decoded.get_i32(0).unwrap(), Some(1));

    let children = decoded.get_list_structs(1).unwrap().unwrap();
    assert_eq!(children.len(), 2);
    let grandchildren = children
        .get(0)
        .unwrap()
        .get_list_structs(1)
        .unwrap()
        .unwrap();
    assert_eq!(grandchildren.get(0).unwrap().get_i32(0).unwrap(), Some(4));
}

#[test]
fn test_is_set_propagates_through_the_tree() {
    let schema = pod_schema();
    let pools = Pools::new();

    let pod = Struct::new(&schema.pod, &pools);
    pod.set_is_set_enabled().unwrap();

    let meta = pod.new_struct(0).unwrap();
    meta.set_i64(1, 0).unwrap();

    let mut buf = Vec::new();
    pod.marshal(&mut buf).unwrap();

    let decoded = Struct::new(&schema.pod, &pools);
    decoded.set_is_set_enabled().unwrap();
    decoded.unmarshal(&mut &buf[..]).unwrap();

    let decoded_meta = decoded.get_struct(0).unwrap().unwrap();
    assert!(decoded_meta.is_set(1).unwrap());
    assert!(!decoded_meta.is_set(0).unwrap());
    assert_eq!(decoded_meta.get_i64(1).unwrap(), None);
}

#[test]
fn test_recycle_and_reuse_through_the_pools() {
    let schema = pod_schema();
    let pools = Pools::new();

    let wire = {
        let pod = sample_pod(&schema, &pools);
        let mut buf = Vec::new();
        pod.marshal(&mut buf).unwrap();
        pod.recycle().unwrap();
        buf
    };

    // Steady state: decode, touch, re-encode, recycle, twice over the same
    // pool registry.
    for _ in 0..2 {
        let pod = Struct::new(&schema.pod, &pools);
        pod.unmarshal(&mut &wire[..]).unwrap();

        let meta = pod.get_struct(0).unwrap().unwrap();
        assert_eq!(meta.get_str(0).unwrap(), Some("web-frontend".to_string()));

        let mut out = Vec::new();
        pod.marshal(&mut out).unwrap();
        assert_eq!(out, wire);

        pod.recycle().unwrap();
    }

    assert!(pools.bytes.class_sizes().values().any(|&n| n > 0));
}

#[test]
fn test_unmarshal_error_surfaces_and_struct_is_recyclable() {
    let schema = pod_schema();
    let pools = Pools::new();

    let mut buf = {
        let pod = sample_pod(&schema, &pools);
        let mut buf = Vec::new();
        pod.marshal(&mut buf).unwrap();
        buf
    };
    // Corrupt the declared total so the scan overruns.
    buf.truncate(buf.len() - 8);

    let target = Struct::new(&schema.pod, &pools);
    let result = target.unmarshal(&mut &buf[..]);
    assert!(matches!(
        result,
        Err(ClawError::UnexpectedEof) | Err(ClawError::Truncated { .. })
    ));

    // The partially built struct is indeterminate but must recycle cleanly.
    target.recycle().unwrap();
}

#[test]
fn test_file_backed_round_trip() {
    let schema = pod_schema();
    let pools = Pools::new();
    let pod = sample_pod(&schema, &pools);

    let mut file: File = tempfile::tempfile().expect("Failed to create temp file");
    let written = pod.marshal(&mut file).unwrap();
    assert_eq!(written, pod.wire_size());

    file.seek(SeekFrom::Start(0)).unwrap();
    let decoded = Struct::unmarshal_from(&schema.pod, &pools, &mut file).unwrap();

    let mut original = Vec::new();
    pod.marshal(&mut original).unwrap();
    let mut re_emitted = Vec::new();
    decoded.marshal(&mut re_emitted).unwrap();
    assert_eq!(re_emitted, original);
}
