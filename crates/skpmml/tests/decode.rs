//! Pickle decoding through the public API: joblib arrays, registry lookup,
//! compressed containers and registry discovery.

use std::fs;

use rstest::rstest;
use tempfile::TempDir;

use skpmml::pickle::{self, Compression, DecodeError, FactoryCatalog, Factory, Storage};
use skpmml::testing::{npy_bytes, PickleBuilder};
use skpmml::{ClassName, Registry, RegistryError, Value};

fn f64_payload(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode(bytes: &[u8]) -> Result<Value, DecodeError> {
    pickle::from_slice(bytes, &Registry::with_defaults())
}

fn array_elements(value: &Value) -> Vec<Value> {
    value.as_array().expect("array").elements().expect("elements")
}

// =============================================================================
// joblib array fast path
// =============================================================================

#[rstest]
#[case(None)]
#[case(Some(8))]
#[case(Some(16))]
fn wrapped_array_exact_payload(#[case] alignment: Option<u8>) {
    let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let mut builder = PickleBuilder::new();
    builder.wrapped_array("<f8", &[2, 3], false, &f64_payload(&values), alignment);
    let value = decode(&builder.stop().to_bytes()).unwrap();

    let array = value.as_array().unwrap();
    assert_eq!(array.shape, vec![2, 3]);
    let expected: Vec<Value> = values.iter().map(|&v| Value::Float(v)).collect();
    assert_eq!(array.elements().unwrap(), expected);
}

#[test]
fn wrapped_array_short_payload() {
    let payload = f64_payload(&[1.0, 2.0, 3.0]);
    let mut builder = PickleBuilder::new();
    builder.wrapped_array("<f8", &[3], false, &payload[..payload.len() - 1], None);
    let err = decode(&builder.to_bytes()).unwrap_err();
    assert!(
        matches!(err, DecodeError::Truncated { expected: 24, actual: 23, .. }),
        "{err}"
    );
}

#[test]
fn wrapped_array_huge_shape_is_truncated_not_allocated() {
    let mut builder = PickleBuilder::new();
    builder.wrapped_array("<f8", &[1 << 60], false, &[0; 3], None);
    let err = decode(&builder.stop().to_bytes()).unwrap_err();
    assert!(
        matches!(err, DecodeError::Truncated { what: "array payload", expected, .. } if expected == 1 << 63),
        "{err}"
    );
}

#[test]
fn wrapped_array_overflowing_shape() {
    let mut builder = PickleBuilder::new();
    builder.wrapped_array("<f8", &[1 << 40, 1 << 40], false, &[], None);
    let err = decode(&builder.stop().to_bytes()).unwrap_err();
    assert!(matches!(err, DecodeError::IntegerOverflow(_)), "{err}");
}

#[test]
fn fortran_order_is_logical_row_major() {
    // column-major payload of [[1, 2, 3], [4, 5, 6]]
    let payload = f64_payload(&[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    let mut builder = PickleBuilder::new();
    builder.wrapped_array("<f8", &[2, 3], true, &payload, None);
    let value = decode(&builder.stop().to_bytes()).unwrap();

    let expected: Vec<Value> = (1..=6).map(|v| Value::Float(f64::from(v))).collect();
    assert_eq!(array_elements(&value), expected);
}

#[test]
fn reduced_and_wrapped_arrays_agree() {
    let values = [0.5, -1.5, 2.25, 8.0];

    let mut reduced = PickleBuilder::new();
    reduced.f64_array(&values, &[2, 2]);
    let reduced = decode(&reduced.stop().to_bytes()).unwrap();

    let mut wrapped = PickleBuilder::new();
    wrapped.wrapped_f64_array(&values, &[2, 2]);
    let wrapped = decode(&wrapped.stop().to_bytes()).unwrap();

    assert_eq!(reduced.as_array().unwrap().shape, wrapped.as_array().unwrap().shape);
    assert_eq!(array_elements(&reduced), array_elements(&wrapped));
}

#[test]
fn wrapped_array_inside_estimator() {
    let mut builder = PickleBuilder::new();
    builder.object("sklearn.linear_model._base", "LinearRegression", |b| {
        b.string("coef_").wrapped_f64_array(&[1.0, 2.0], &[2]);
        b.string("intercept_").float(0.5);
    });
    let value = decode(&builder.stop().to_bytes()).unwrap();

    let record = value.as_record().unwrap();
    assert_eq!(record.get_f64_values("coef_").unwrap(), vec![1.0, 2.0]);
    assert!(record.as_estimator().is_some());
}

// =============================================================================
// joblib < 0.10 array files
// =============================================================================

fn array_file_pickle() -> Vec<u8> {
    let mut builder = PickleBuilder::new();
    builder.object("sklearn.linear_model._logistic", "LogisticRegression", |b| {
        b.string("coef_").array_file("pipeline.pkl_01.npy");
        b.string("intercept_").array_file("pipeline.pkl_02.npy");
        b.string("classes_").array_file("pipeline.pkl_03.npy");
    });
    builder.stop().to_bytes()
}

#[test]
fn array_files_resolve_next_to_the_pickle() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pipeline.pkl");
    fs::write(&path, array_file_pickle()).unwrap();
    // column-major [[1, 2], [3, 4]]
    fs::write(
        dir.path().join("pipeline.pkl_01.npy"),
        npy_bytes(1, "<f8", &[2, 2], true, &f64_payload(&[1.0, 3.0, 2.0, 4.0])),
    )
    .unwrap();
    fs::write(
        dir.path().join("pipeline.pkl_02.npy"),
        npy_bytes(2, "<f8", &[2], false, &f64_payload(&[0.5, -0.5])),
    )
    .unwrap();
    let mut classes = PickleBuilder::new();
    classes.str_array(&["no", "yes"]).stop();
    fs::write(
        dir.path().join("pipeline.pkl_03.npy"),
        npy_bytes(1, "|O", &[2], false, &classes.to_bytes()),
    )
    .unwrap();

    let storage = Storage::open(&path).unwrap();
    let value = pickle::load(&storage, &Registry::with_defaults()).unwrap();
    let record = value.as_record().unwrap();

    assert_eq!(record.get_f64_values("coef_").unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(record.get_required("coef_").unwrap().as_array().unwrap().shape, vec![2, 2]);
    assert_eq!(record.get_f64_values("intercept_").unwrap(), vec![0.5, -0.5]);
    assert_eq!(
        array_elements(record.get_required("classes_").unwrap()),
        vec![Value::from("no"), Value::from("yes")]
    );
}

#[test]
fn missing_array_file_names_its_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pipeline.pkl");
    fs::write(&path, array_file_pickle()).unwrap();

    let storage = Storage::open(&path).unwrap();
    let err = pickle::load(&storage, &Registry::with_defaults()).unwrap_err();
    match err {
        DecodeError::ArrayFile { path, source } => {
            assert_eq!(path, dir.path().join("pipeline.pkl_01.npy"));
            assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
        }
        other => panic!("expected an array file error, got {other}"),
    }
}

#[test]
fn array_files_need_a_file_backed_storage() {
    let storage = Storage::from_bytes(array_file_pickle());
    let err = pickle::load(&storage, &Registry::with_defaults()).unwrap_err();
    assert!(matches!(err, DecodeError::InvalidState(_)), "{err}");
}

// =============================================================================
// Registry
// =============================================================================

#[test]
fn generic_record_keeps_class_and_state() {
    let mut registry = Registry::new();
    registry.register("m", "n", Factory::Generic);

    let mut builder = PickleBuilder::new();
    builder.object("m", "n", |b| {
        b.string("a").int(1);
        b.string("b").int(2);
    });
    let value = pickle::from_slice(&builder.stop().to_bytes(), &registry).unwrap();

    let record = value.as_record().unwrap();
    assert_eq!(record.class(), &ClassName::new("m", "n"));
    let fields: Vec<_> = record.fields().iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
    assert_eq!(fields, vec![("a", Value::Int(1)), ("b", Value::Int(2))]);
}

#[test]
fn unknown_classes_decode_generically() {
    let mut builder = PickleBuilder::new();
    builder.object("somewhere.unknown", "Thing", |b| {
        b.string("x").string("y");
    });
    let value = decode(&builder.stop().to_bytes()).unwrap();
    let record = value.as_record().unwrap();
    assert_eq!(record.get_string("x").unwrap(), "y");
    assert!(record.as_estimator().is_none());
    assert!(record.as_transformer().is_none());
}

// =============================================================================
// Storage
// =============================================================================

fn sample_pickle() -> Vec<u8> {
    let mut builder = PickleBuilder::new();
    builder.object("sklearn.preprocessing._data", "StandardScaler", |b| {
        b.string("mean_").wrapped_f64_array(&[1.0, 2.0], &[2]);
        b.string("scale_").f64_array(&[3.0, 4.0], &[2]);
    });
    builder.stop().to_bytes()
}

#[cfg(feature = "compression")]
fn compress(bytes: &[u8], compression: Compression) -> Vec<u8> {
    use std::io::Write;

    use flate2::write::{GzEncoder, ZlibEncoder};

    match compression {
        Compression::None => bytes.to_vec(),
        Compression::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(bytes).unwrap();
            encoder.finish().unwrap()
        }
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(bytes).unwrap();
            encoder.finish().unwrap()
        }
        Compression::Zstd => zstd::encode_all(bytes, 0).unwrap(),
        Compression::JoblibZfile => {
            let mut container = b"ZF".to_vec();
            let length = format!("{:#x}", bytes.len());
            container.extend_from_slice(format!("{length:<19}").as_bytes());
            container.extend(compress(bytes, Compression::Zlib));
            container
        }
    }
}

#[cfg(feature = "compression")]
#[rstest]
#[case(Compression::None)]
#[case(Compression::Zlib)]
#[case(Compression::Gzip)]
#[case(Compression::Zstd)]
#[case(Compression::JoblibZfile)]
fn compressed_files_decode_identically(#[case] compression: Compression) {
    let plain = sample_pickle();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pipeline.pkl");
    fs::write(&path, compress(&plain, compression)).unwrap();

    let storage = Storage::open(&path).unwrap();
    assert_eq!(storage.compression(), compression);
    assert_eq!(storage.path(), Some(path.as_path()));

    let registry = Registry::with_defaults();
    let decoded = pickle::load(&storage, &registry).unwrap();
    assert_eq!(decoded, pickle::from_slice(&plain, &registry).unwrap());
}

#[cfg(feature = "compression")]
#[test]
fn in_memory_storage_detects_compression() {
    let plain = sample_pickle();
    let storage = Storage::from_bytes(compress(&plain, Compression::Gzip));
    assert_eq!(storage.compression(), Compression::Gzip);
    assert!(storage.path().is_none());
    let value = pickle::load(&storage, &Registry::with_defaults()).unwrap();
    assert!(value.as_record().unwrap().as_transformer().is_some());
}

#[test]
fn missing_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = Storage::open(dir.path().join("absent.pkl")).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
}

#[test]
fn convert_reports_missing_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.pkl");
    let err = skpmml::convert(&path, &Registry::with_defaults(), &Default::default()).unwrap_err();
    assert!(matches!(err, skpmml::Error::Io { .. }));
}

#[test]
fn convert_rejects_bz2_files() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pipeline.pkl.bz2");
    fs::write(&path, b"BZh91AY&SY\x00\x00").unwrap();

    let err = skpmml::convert(&path, &Registry::with_defaults(), &Default::default()).unwrap_err();
    match err {
        skpmml::Error::Io { path: reported, source } => {
            assert_eq!(reported, path);
            assert_eq!(source.kind(), std::io::ErrorKind::Unsupported);
        }
        other => panic!("expected an I/O error, got {other}"),
    }
}

// =============================================================================
// Registry discovery
// =============================================================================

#[test]
fn discover_reads_properties_files() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("META-INF")).unwrap();
    fs::write(
        dir.path().join("META-INF").join("sklearn2pmml.properties"),
        "# custom estimators\nacme.models.Ridge = linear_regression\n",
    )
    .unwrap();

    let registry = Registry::discover(&[dir.path()], &FactoryCatalog::with_defaults()).unwrap();
    assert!(matches!(registry.resolve("acme.models", "Ridge"), Factory::Specialized(_)));
    // defaults stay available
    assert!(registry.contains("sklearn.preprocessing", "StandardScaler"));

    let mut builder = PickleBuilder::new();
    builder.object("acme.models", "Ridge", |b| {
        b.string("coef_").f64_array(&[1.0], &[1]);
        b.string("intercept_").float(0.0);
    });
    let value = pickle::from_slice(&builder.stop().to_bytes(), &registry).unwrap();
    assert!(value.as_record().unwrap().as_estimator().is_some());
}

#[rstest]
#[case("NoDot = linear_regression")]
#[case("acme.Model = no_such_factory")]
fn discover_rejects_bad_entries(#[case] line: &str) {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("sklearn2pmml.properties"), line).unwrap();

    let err = Registry::discover(&[dir.path()], &FactoryCatalog::with_defaults()).unwrap_err();
    assert!(matches!(
        err,
        RegistryError::MalformedKey { line: 1, .. } | RegistryError::UnknownFactory { line: 1, .. }
    ));
}
