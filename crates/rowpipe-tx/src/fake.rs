//! Synthetic and anonymized values.
//!
//! Each mapping assigns a generator to a target column. A generator is
//! either a dotted path into the built-in registry (`name.firstname`,
//! `internet.email`, ...) or a template, which renders exactly like the
//! format transformer. In deterministic mode the value for a row is derived
//! from a 32-bit FNV-1a hash of the generator path combined with the row's
//! seed-column value, so the same input key maps to the same output on every
//! run and platform. Generated values are memoized in a paged cache bounded
//! at 65 536 entries per generator.

use fake::faker::address::en::{CityName, CountryName, StateName, StreetName, ZipCode};
use fake::faker::company::en::{Buzzword, CompanyName, Industry};
use fake::faker::finance::en::Bic;
use fake::faker::internet::en::{IPv4, Password, SafeEmail, Username};
use fake::faker::lorem::en::{Sentence, Word};
use fake::faker::name::en::{FirstName, LastName, Name, Title};
use fake::faker::phone_number::en::PhoneNumber;
use fake::Fake as _;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rowpipe_core::contract::Transformer;
use rowpipe_core::error::{PipeError, Result};
use rowpipe_core::row::{LogicalType, Row, Value};
use rowpipe_core::schema::{Column, Schema};

use crate::basic::split_mapping;
use crate::format::Format;

const PAGE_SIZE: usize = 1_024;
const MAX_CACHED: usize = 65_536;

/// 32-bit FNV-1a.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Fixed-size memo of generated values, paged in on demand.
struct PagedCache {
    pages: Vec<Option<Vec<Option<String>>>>,
}

impl PagedCache {
    fn new() -> Self {
        PagedCache {
            pages: (0..MAX_CACHED / PAGE_SIZE).map(|_| None).collect(),
        }
    }

    fn get_or_insert_with(
        &mut self,
        bucket: usize,
        make: impl FnOnce() -> Result<String>,
    ) -> Result<String> {
        let page_no = bucket / PAGE_SIZE;
        let slot = bucket % PAGE_SIZE;
        let page = self.pages[page_no].get_or_insert_with(|| vec![None; PAGE_SIZE]);
        if let Some(hit) = &page[slot] {
            return Ok(hit.clone());
        }
        let value = make()?;
        page[slot] = Some(value.clone());
        Ok(value)
    }
}

/// Produce one value for a registry path.
fn run_generator(path: &str, rng: &mut StdRng) -> Result<String> {
    let value: String = match path {
        "name.firstname" | "name.first_name" => FirstName().fake_with_rng(rng),
        "name.lastname" | "name.last_name" => LastName().fake_with_rng(rng),
        "name.fullname" | "name.name" => Name().fake_with_rng(rng),
        "name.title" => Title().fake_with_rng(rng),
        "address.city" => CityName().fake_with_rng(rng),
        "address.street" => StreetName().fake_with_rng(rng),
        "address.zipcode" => ZipCode().fake_with_rng(rng),
        "address.state" => StateName().fake_with_rng(rng),
        "address.country" => CountryName().fake_with_rng(rng),
        "internet.email" => SafeEmail().fake_with_rng(rng),
        "internet.username" => Username().fake_with_rng(rng),
        "internet.ip" => IPv4().fake_with_rng(rng),
        "internet.password" => Password(12..20).fake_with_rng(rng),
        "company.name" => CompanyName().fake_with_rng(rng),
        "company.buzzword" => Buzzword().fake_with_rng(rng),
        "company.industry" => Industry().fake_with_rng(rng),
        "phone.number" => PhoneNumber().fake_with_rng(rng),
        "lorem.word" => Word().fake_with_rng(rng),
        "lorem.sentence" => Sentence(3..8).fake_with_rng(rng),
        "finance.bic" => Bic().fake_with_rng(rng),
        "finance.iban" => iban(rng),
        "guid" | "uuid" => uuid::Uuid::from_u128(rng.gen::<u128>()).to_string(),
        other => {
            return Err(PipeError::InvalidConfiguration(format!(
                "unknown generator path '{other}'"
            )))
        }
    };
    Ok(value)
}

/// IBAN-shaped value: country, check digits, BBAN. Shape only, not a valid
/// checksum.
fn iban(rng: &mut StdRng) -> String {
    const COUNTRIES: [&str; 6] = ["DE", "FR", "NL", "ES", "IT", "GB"];
    let country = COUNTRIES[rng.gen_range(0..COUNTRIES.len())];
    let check = rng.gen_range(10..98u32);
    let mut digits = String::with_capacity(18);
    for _ in 0..18 {
        digits.push(char::from(b'0' + rng.gen_range(0..10u8)));
    }
    format!("{country}{check:02}{digits}")
}

/// A registry-path generator with its memo. Template mappings are
/// delegated to the format transformer wholesale.
struct PathGenerator {
    path: String,
    cache: PagedCache,
}

pub struct Anonymize {
    path_mappings: Vec<(String, PathGenerator)>,
    template: Option<Format>,
    deterministic: bool,
    seed_column: Option<String>,
    seed_idx: Option<usize>,
    resolved: Vec<usize>,
    entropy: StdRng,
}

impl Anonymize {
    pub fn parse(
        raw: &[String],
        deterministic: bool,
        seed_column: Option<String>,
    ) -> Result<Self> {
        let mut path_mappings = Vec::new();
        let mut template_mappings = Vec::new();
        for entry in raw {
            let (column, gen) = split_mapping(entry)?;
            if gen.contains('{') {
                template_mappings.push(format!("{column}:{gen}"));
            } else {
                path_mappings.push((
                    column,
                    PathGenerator {
                        path: gen.trim().to_string(),
                        cache: PagedCache::new(),
                    },
                ));
            }
        }
        let template = if template_mappings.is_empty() {
            None
        } else {
            Some(Format::parse(&template_mappings)?)
        };
        Ok(Anonymize {
            path_mappings,
            template,
            deterministic,
            seed_column,
            seed_idx: None,
            resolved: Vec::new(),
            entropy: StdRng::from_entropy(),
        })
    }

    /// The cache bucket for a row: the seed value folded to 16 bits.
    fn bucket_for(&self, row: &Row) -> usize {
        let Some(idx) = self.seed_idx else { return 0 };
        match row.get(idx) {
            Value::Int32(v) => (*v as u64 % MAX_CACHED as u64) as usize,
            Value::Int64(v) => (*v as u64 % MAX_CACHED as u64) as usize,
            other => fnv1a32(other.canonical_text().as_bytes()) as usize % MAX_CACHED,
        }
    }
}

impl Transformer for Anonymize {
    fn initialize(&mut self, input: &Schema) -> Result<Schema> {
        // Reject unknown registry paths before any rows flow.
        let mut probe = StdRng::seed_from_u64(0);
        for (_, gen) in &self.path_mappings {
            run_generator(&gen.path, &mut probe)?;
        }

        let mut schema = match &mut self.template {
            Some(t) => t.initialize(input)?,
            None => input.clone(),
        };
        for (column, _) in &self.path_mappings {
            if schema.find(column).is_none() {
                schema = schema
                    .with_column(Column::new(column.clone(), LogicalType::String).virtual_col())?;
            }
        }
        self.resolved = self
            .path_mappings
            .iter()
            .map(|(column, _)| schema.find(column).expect("resolved or appended above"))
            .collect();

        if let Some(seed) = &self.seed_column {
            self.seed_idx = Some(schema.find(seed).ok_or_else(|| {
                PipeError::InvalidConfiguration(format!(
                    "seed column '{seed}' is not in the schema"
                ))
            })?);
        }
        Ok(schema)
    }

    fn transform(&mut self, row: Row) -> Result<Option<Row>> {
        let mut row = match &mut self.template {
            Some(t) => match t.transform(row)? {
                Some(r) => r,
                None => return Ok(None),
            },
            None => row,
        };
        let width = self.resolved.iter().map(|&i| i + 1).max().unwrap_or(0);
        while row.len() < width {
            row.0.push(Value::Null);
        }

        let bucket = self.bucket_for(&row);
        let deterministic = self.deterministic;
        for ((_, gen), &target) in self.path_mappings.iter_mut().zip(&self.resolved) {
            let path = gen.path.clone();
            let value = if deterministic {
                gen.cache.get_or_insert_with(bucket, || {
                    let seed = ((fnv1a32(path.as_bytes()) as u64) << 16) | bucket as u64;
                    let mut rng = StdRng::seed_from_u64(seed);
                    run_generator(&path, &mut rng)
                })?
            } else {
                run_generator(&path, &mut self.entropy)?
            };
            row.set(target, Value::String(value));
        }
        Ok(Some(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("id", LogicalType::Int64),
            Column::new("email", LogicalType::String),
        ])
        .unwrap()
    }

    fn row(id: i64) -> Row {
        Row::new(vec![Value::Int64(id), Value::String("real@example.com".into())])
    }

    #[test]
    fn fnv1a32_reference_vectors() {
        // Well-known FNV-1a digests.
        assert_eq!(fnv1a32(b""), 0x811c9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn deterministic_mode_is_stable_per_seed_value() {
        let mk = || {
            let mut a =
                Anonymize::parse(&["email:internet.email".to_string()], true, Some("id".into()))
                    .unwrap();
            a.initialize(&schema()).unwrap();
            a
        };
        let mut a1 = mk();
        let mut a2 = mk();
        let v1 = a1.transform(row(42)).unwrap().unwrap();
        let v2 = a2.transform(row(42)).unwrap().unwrap();
        assert_eq!(v1.get(1), v2.get(1));
        // Same seed value later in the stream maps to the same output.
        let v3 = a1.transform(row(42)).unwrap().unwrap();
        assert_eq!(v1.get(1), v3.get(1));
        // A different seed value lands elsewhere.
        let v4 = a1.transform(row(43)).unwrap().unwrap();
        assert_ne!(v1.get(1), v4.get(1));
    }

    #[test]
    fn different_generators_diverge_for_one_seed() {
        let mut a = Anonymize::parse(
            &["email:internet.email".to_string()],
            true,
            Some("id".into()),
        )
        .unwrap();
        let mut b = Anonymize::parse(
            &["email:name.fullname".to_string()],
            true,
            Some("id".into()),
        )
        .unwrap();
        a.initialize(&schema()).unwrap();
        b.initialize(&schema()).unwrap();
        let va = a.transform(row(7)).unwrap().unwrap();
        let vb = b.transform(row(7)).unwrap().unwrap();
        assert_ne!(va.get(1), vb.get(1));
    }

    #[test]
    fn unknown_path_fails_initialize() {
        let mut a = Anonymize::parse(&["email:not.real".to_string()], false, None).unwrap();
        assert!(matches!(
            a.initialize(&schema()).unwrap_err(),
            PipeError::InvalidConfiguration(_)
        ));
    }

    #[test]
    fn template_mappings_render_like_format() {
        let mut a = Anonymize::parse(&["email:{{id}}@masked.invalid".to_string()], false, None)
            .unwrap();
        a.initialize(&schema()).unwrap();
        let out = a.transform(row(9)).unwrap().unwrap();
        assert_eq!(out.get(1), &Value::String("9@masked.invalid".into()));
    }

    #[test]
    fn new_target_column_is_appended_virtual() {
        let mut a = Anonymize::parse(&["alias:name.firstname".to_string()], false, None).unwrap();
        let s = a.initialize(&schema()).unwrap();
        assert_eq!(s.len(), 3);
        assert!(s.column(2).virtual_);
        let out = a.transform(row(1)).unwrap().unwrap();
        assert!(matches!(out.get(2), Value::String(s) if !s.is_empty()));
    }

    #[test]
    fn iban_shape() {
        let mut rng = StdRng::seed_from_u64(1);
        let v = iban(&mut rng);
        assert_eq!(v.len(), 22);
        assert!(v[0..2].chars().all(|c| c.is_ascii_uppercase()));
        assert!(v[2..].chars().all(|c| c.is_ascii_digit()));
    }
}
