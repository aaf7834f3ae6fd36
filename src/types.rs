// ========================================================================================
//
//                      Shared data types for the coordinator and its workers
//
// ========================================================================================

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Genotype dosage of one sample at one site: 0, 1 or 2 copies of the second allele.
pub type GroupLabel = u8;

/// The p-value reported for sites that were not submitted to the engine.
pub const UNTESTED_P_VALUE: f64 = 1.0;

/// A sample in the distance matrix together with its 0-based column in VCF records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub name: String,
    pub column: usize,
}

/// Per-site statistics that must be present in the INFO field.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SiteInfo {
    /// Minor allele frequency
    pub maf: f64,
    /// Imputation quality
    pub r2: f64,
}

/// One output row. Fields that may be unavailable stay `None` until formatting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub chrom: String,
    pub pos: u64,
    pub id: String,
    pub a1: String,
    pub a2: String,
    /// Frequency of the second allele among the tested samples
    #[serde(with = "float_repr::option")]
    pub a2_freq: Option<f64>,
    /// MAF for all samples in the VCF, as recorded in INFO
    #[serde(with = "float_repr::option")]
    pub all_maf: Option<f64>,
    #[serde(with = "float_repr::option")]
    pub r2: Option<f64>,
    /// `None` when the site was filtered or had a single genotype group
    #[serde(with = "float_repr::option")]
    pub statistic: Option<f64>,
    #[serde(with = "float_repr")]
    pub p_value: f64,
}

/// Thresholds, error policy and engine resources every worker needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Drop invalid sites rather than terminating the run
    pub permissive: bool,
    /// Sites are tested only if R2 > min_r2
    pub min_r2: f64,
    /// Sites are tested only if MAF >= min_maf
    pub min_maf: f64,
    /// R script defining `DBF.test`
    pub script: PathBuf,
    /// R interpreter used to run the script
    pub rscript: PathBuf,
}

/// Read-only state built once by the coordinator and handed to every worker
/// as the first message it receives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    settings: Settings,
    matrix_values: Vec<f64>,
    samples: Vec<Sample>,
}

impl GlobalState {
    /// `matrix_values` is the row-major distance matrix over `samples`, in the
    /// same order.
    pub fn new(settings: Settings, matrix_values: Vec<f64>, samples: Vec<Sample>) -> Self {
        assert_eq!(
            matrix_values.len(),
            samples.len() * samples.len(),
            "distance matrix does not match the number of samples"
        );

        Self {
            settings,
            matrix_values,
            samples,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn matrix_values(&self) -> &[f64] {
        &self.matrix_values
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// JSON has no spelling for NaN or infinities, which the engine may legitimately
/// return. Finite values are written as numbers, the rest as strings.
mod float_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    impl Repr {
        fn into_f64<E: serde::de::Error>(self) -> Result<f64, E> {
            match self {
                Repr::Number(value) => Ok(value),
                Repr::Text(text) => text
                    .parse()
                    .map_err(|_| E::custom(format!("invalid float {text:?}"))),
            }
        }
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_str(&value.to_string())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Repr::deserialize(deserializer)?.into_f64()
    }

    pub mod option {
        use super::Repr;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<f64>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<f64>, D::Error> {
            Option::<Repr>::deserialize(deserializer)?
                .map(Repr::into_f64)
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(statistic: Option<f64>, p_value: f64) -> ResultRecord {
        ResultRecord {
            chrom: "1".into(),
            pos: 100,
            id: "rs1".into(),
            a1: "A".into(),
            a2: "G".into(),
            a2_freq: Some(0.25),
            all_maf: None,
            r2: Some(0.9),
            statistic,
            p_value,
        }
    }

    #[test]
    fn non_finite_engine_values_survive_serialization() {
        let original = record(Some(f64::NAN), f64::INFINITY);
        let json = serde_json::to_string(&original).unwrap();
        let decoded: ResultRecord = serde_json::from_str(&json).unwrap();

        assert!(decoded.statistic.unwrap().is_nan());
        assert_eq!(decoded.p_value, f64::INFINITY);
        assert_eq!(decoded.all_maf, None);
        assert_eq!(decoded.a2_freq, Some(0.25));
    }

    #[test]
    fn missing_values_serialize_as_null() {
        let json = serde_json::to_string(&record(None, UNTESTED_P_VALUE)).unwrap();
        assert!(json.contains("\"statistic\":null"), "{json}");
        assert!(json.contains("\"p_value\":1.0"), "{json}");
    }

    #[test]
    #[should_panic(expected = "distance matrix does not match")]
    fn global_state_rejects_mismatched_matrix() {
        let settings = Settings {
            permissive: false,
            min_r2: 0.4,
            min_maf: 0.01,
            script: PathBuf::from("DBF_test.R"),
            rscript: PathBuf::from("Rscript"),
        };
        let samples = vec![Sample {
            name: "a".into(),
            column: 9,
        }];
        GlobalState::new(settings, vec![0.0, 1.0], samples);
    }
}
