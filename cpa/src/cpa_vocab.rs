use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

pub const PAD_TOKEN: &str = "<PAD>";
pub const PAD_INDEX: u32 = 0;
pub const CONTROL_INDEX: u32 = 1;
pub const COMBINATION_DELIM: char = '+';

/// A frozen bijection between category names and `0..n`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CategoryVocab {
    names: Vec<Box<str>>,
    index: HashMap<Box<str>, usize>,
}

impl CategoryVocab {
    /// Index by position; duplicated names are an error
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> anyhow::Result<Self> {
        let names: Vec<Box<str>> = names.iter().map(|s| s.as_ref().into()).collect();
        let mut index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            if index.insert(name.clone(), i).is_some() {
                anyhow::bail!("duplicate category name: {}", name);
            }
        }
        Ok(Self { names, index })
    }

    /// Distinct values sorted lexicographically
    pub fn from_values<S: AsRef<str>>(values: &[S]) -> anyhow::Result<Self> {
        let unique: BTreeSet<&str> = values.iter().map(|s| s.as_ref()).collect();
        Self::from_names(&unique.into_iter().collect::<Vec<_>>())
    }

    /// The mapping must hit every index in `0..n` exactly once
    pub fn from_mapping(mapping: &BTreeMap<String, usize>) -> anyhow::Result<Self> {
        let n = mapping.len();
        let mut names: Vec<Option<Box<str>>> = vec![None; n];
        for (name, &i) in mapping.iter() {
            if i >= n {
                anyhow::bail!("index {} of '{}' is out of range (n = {})", i, name, n);
            }
            if names[i].is_some() {
                anyhow::bail!("index {} is assigned twice", i);
            }
            names[i] = Some(name.as_str().into());
        }
        let names: Vec<Box<str>> = names.into_iter().flatten().collect();
        Self::from_names(&names)
    }

    pub fn to_mapping(&self) -> BTreeMap<String, usize> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, s)| (s.to_string(), i))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn name(&self, idx: usize) -> Option<&str> {
        self.names.get(idx).map(|s| s.as_ref())
    }

    pub fn names(&self) -> &[Box<str>] {
        &self.names
    }
}

/// On-disk layout of the vocabularies, a name -> index document
#[derive(Serialize, Deserialize, Debug)]
struct VocabularyDocument {
    pert_encoder: BTreeMap<String, usize>,
    covars_encoder: BTreeMap<String, BTreeMap<String, usize>>,
    conditions: BTreeMap<String, usize>,
    control: String,
    max_comb_len: usize,
}

/// Per-cell indices ready to be turned into tensors
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedCells {
    pub num_cells: usize,
    pub max_comb_len: usize,
    /// `num_cells * max_comb_len`, row major
    pub perts: Vec<u32>,
    /// `num_cells * max_comb_len`, row major
    pub doses: Vec<f32>,
    pub conditions: Vec<u32>,
    pub covariates: BTreeMap<Box<str>, Vec<u32>>,
}

/// Perturbation, condition and covariate vocabularies of one model.
///
/// Built once before the model and handed to it; never changed
/// afterwards. Perturbation index 0 is the padding token and index 1 is
/// the control token.
#[derive(Clone, Debug, PartialEq)]
pub struct CpaVocabulary {
    perturbations: CategoryVocab,
    conditions: CategoryVocab,
    covariates: BTreeMap<Box<str>, CategoryVocab>,
    control: Box<str>,
    max_comb_len: usize,
}

impl CpaVocabulary {
    /// Build vocabularies from per-cell annotations
    ///
    /// * `conditions` - one `+`-joined perturbation combination per cell
    /// * `control` - name of the control perturbation
    /// * `covariates` - `(covariate name, one value per cell)`
    /// * `max_comb_len` - number of perturbation slots per cell
    pub fn build<S: AsRef<str>>(
        conditions: &[S],
        control: &str,
        covariates: &[(&str, &[S])],
        max_comb_len: usize,
    ) -> anyhow::Result<Self> {
        if max_comb_len == 0 {
            anyhow::bail!("max_comb_len must be positive");
        }

        let mut others = BTreeSet::new();
        for cond in conditions.iter() {
            let parts = split_combination(cond.as_ref());
            if parts.len() > max_comb_len {
                anyhow::bail!(
                    "condition '{}' has {} perturbations, more than max_comb_len = {}",
                    cond.as_ref(),
                    parts.len(),
                    max_comb_len
                );
            }
            for p in parts {
                if p != control {
                    others.insert(p);
                }
            }
        }

        let mut tokens: Vec<&str> = vec![PAD_TOKEN, control];
        tokens.extend(others);
        let perturbations = CategoryVocab::from_names(&tokens)?;
        let condition_vocab = CategoryVocab::from_values(conditions)?;

        let mut covariate_vocabs = BTreeMap::new();
        for (name, values) in covariates.iter() {
            if values.len() != conditions.len() {
                anyhow::bail!(
                    "covariate '{}' has {} values for {} cells",
                    name,
                    values.len(),
                    conditions.len()
                );
            }
            covariate_vocabs.insert((*name).into(), CategoryVocab::from_values(values)?);
        }

        info!(
            "vocabulary: {} perturbation tokens, {} conditions, {} covariates",
            perturbations.len(),
            condition_vocab.len(),
            covariate_vocabs.len()
        );

        Ok(Self {
            perturbations,
            conditions: condition_vocab,
            covariates: covariate_vocabs,
            control: control.into(),
            max_comb_len,
        })
    }

    pub fn perturbations(&self) -> &CategoryVocab {
        &self.perturbations
    }

    pub fn conditions(&self) -> &CategoryVocab {
        &self.conditions
    }

    pub fn covariates(&self) -> &BTreeMap<Box<str>, CategoryVocab> {
        &self.covariates
    }

    pub fn covariate(&self, name: &str) -> anyhow::Result<&CategoryVocab> {
        self.covariates
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("covariate '{}' not found in learned covariates", name))
    }

    pub fn covariate_names(&self) -> impl Iterator<Item = &str> {
        self.covariates.keys().map(|k| &**k)
    }

    pub fn control(&self) -> &str {
        &self.control
    }

    pub fn max_comb_len(&self) -> usize {
        self.max_comb_len
    }

    pub fn num_perturbations(&self) -> usize {
        self.perturbations.len()
    }

    pub fn num_conditions(&self) -> usize {
        self.conditions.len()
    }

    /// Perturbation indices and dosages of one condition, padded to
    /// `max_comb_len` with `PAD_INDEX` and zero dosage. Without
    /// `dosage`, every listed perturbation gets 1.0.
    pub fn encode_condition(
        &self,
        condition: &str,
        dosage: Option<&str>,
    ) -> anyhow::Result<(Vec<u32>, Vec<f32>)> {
        let names = split_combination(condition);
        if names.len() > self.max_comb_len {
            anyhow::bail!(
                "condition '{}' exceeds max_comb_len = {}",
                condition,
                self.max_comb_len
            );
        }

        let doses: Vec<f32> = match dosage {
            Some(dosage) => split_combination(dosage)
                .into_iter()
                .map(|d| {
                    d.parse::<f32>()
                        .map_err(|e| anyhow::anyhow!("invalid dosage '{}': {}", d, e))
                })
                .collect::<anyhow::Result<_>>()?,
            None => vec![1.0; names.len()],
        };

        if doses.len() != names.len() {
            anyhow::bail!(
                "condition '{}' lists {} perturbations but {} dosages",
                condition,
                names.len(),
                doses.len()
            );
        }

        let mut perts = Vec::with_capacity(self.max_comb_len);
        for name in names.iter() {
            let idx = self
                .perturbations
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("unknown perturbation '{}'", name))?;
            perts.push(idx as u32);
        }

        let mut doses = doses;
        perts.resize(self.max_comb_len, PAD_INDEX);
        doses.resize(self.max_comb_len, 0.0);
        Ok((perts, doses))
    }

    pub fn encode_covariate(&self, covariate: &str, value: &str) -> anyhow::Result<u32> {
        let vocab = self.covariate(covariate)?;
        vocab
            .get(value)
            .map(|i| i as u32)
            .ok_or_else(|| {
                anyhow::anyhow!("unknown value '{}' of covariate '{}'", value, covariate)
            })
    }

    pub fn encode_condition_label(&self, condition: &str) -> anyhow::Result<u32> {
        self.conditions
            .get(condition)
            .map(|i| i as u32)
            .ok_or_else(|| anyhow::anyhow!("unknown condition '{}'", condition))
    }

    /// Encode a set of cells with the frozen vocabularies
    ///
    /// * `conditions` - one condition per cell
    /// * `dosages` - optional `+`-joined dosages per cell
    /// * `covariates` - `(covariate name, one value per cell)`; must
    ///   cover every covariate of the vocabulary
    pub fn encode_cells<S: AsRef<str>>(
        &self,
        conditions: &[S],
        dosages: Option<&[S]>,
        covariates: &[(&str, &[S])],
    ) -> anyhow::Result<EncodedCells> {
        let nn = conditions.len();
        let mut perts = Vec::with_capacity(nn * self.max_comb_len);
        let mut doses = Vec::with_capacity(nn * self.max_comb_len);
        let mut condition_labels = Vec::with_capacity(nn);

        if let Some(dosages) = dosages {
            if dosages.len() != nn {
                anyhow::bail!("{} dosages for {} cells", dosages.len(), nn);
            }
        }

        for (i, cond) in conditions.iter().enumerate() {
            let dose = dosages.map(|d| d[i].as_ref());
            let (p, d) = self.encode_condition(cond.as_ref(), dose)?;
            perts.extend(p);
            doses.extend(d);
            condition_labels.push(self.encode_condition_label(cond.as_ref())?);
        }

        let provided: HashMap<&str, &[S]> = covariates.iter().map(|(k, v)| (*k, *v)).collect();
        let mut covariate_labels = BTreeMap::new();
        for name in self.covariates.keys() {
            let values = provided
                .get(&**name)
                .ok_or_else(|| anyhow::anyhow!("missing covariate '{}'", name))?;
            if values.len() != nn {
                anyhow::bail!("covariate '{}' has {} values for {} cells", name, values.len(), nn);
            }
            let labels = values
                .iter()
                .map(|v| self.encode_covariate(name, v.as_ref()))
                .collect::<anyhow::Result<Vec<_>>>()?;
            covariate_labels.insert(name.clone(), labels);
        }

        Ok(EncodedCells {
            num_cells: nn,
            max_comb_len: self.max_comb_len,
            perts,
            doses,
            conditions: condition_labels,
            covariates: covariate_labels,
        })
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        let doc = VocabularyDocument {
            pert_encoder: self.perturbations.to_mapping(),
            covars_encoder: self
                .covariates
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_mapping()))
                .collect(),
            conditions: self.conditions.to_mapping(),
            control: self.control.to_string(),
            max_comb_len: self.max_comb_len,
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let doc: VocabularyDocument = serde_json::from_str(json)?;

        let perturbations = CategoryVocab::from_mapping(&doc.pert_encoder)?;
        if perturbations.name(PAD_INDEX as usize) != Some(PAD_TOKEN) {
            anyhow::bail!("perturbation index {} must be {}", PAD_INDEX, PAD_TOKEN);
        }
        if perturbations.get(&doc.control) != Some(CONTROL_INDEX as usize) {
            anyhow::bail!(
                "control '{}' must be perturbation index {}",
                doc.control,
                CONTROL_INDEX
            );
        }
        if doc.max_comb_len == 0 {
            anyhow::bail!("max_comb_len must be positive");
        }

        let mut covariates = BTreeMap::new();
        for (name, mapping) in doc.covars_encoder.iter() {
            covariates.insert(name.as_str().into(), CategoryVocab::from_mapping(mapping)?);
        }

        Ok(Self {
            perturbations,
            conditions: CategoryVocab::from_mapping(&doc.conditions)?,
            covariates,
            control: doc.control.into(),
            max_comb_len: doc.max_comb_len,
        })
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, self.to_json()?)?;
        info!("wrote vocabulary to {}", path.display());
        Ok(())
    }

    pub fn read_json(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

fn split_combination(s: &str) -> Vec<&str> {
    s.split(COMBINATION_DELIM)
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .collect()
}
