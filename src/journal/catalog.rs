use crate::errors::{JournalError, JournalResult};
use crate::journal::types::{new_id, Factor, Model};
use crate::stats::aggregate::{NameResolver, DELETED_FACTOR, DELETED_MODEL};
use crate::stats::key::{is_valid_part, ModelKey, KEY_SEPARATOR};

/// Trim and check a user-supplied display name.
fn clean_name(raw: &str) -> JournalResult<String> {
    let name = raw.trim();
    if !is_valid_part(name) {
        return Err(JournalError::Validation(format!(
            "name must be non-empty and must not contain '{KEY_SEPARATOR}'"
        )));
    }
    Ok(name.to_string())
}

/// Move the entry with `from` index to `to` and renumber every `order`.
fn reorder<T>(items: &mut Vec<T>, from: usize, to: usize, set_order: impl Fn(&mut T, usize)) {
    let to = to.min(items.len().saturating_sub(1));
    let item = items.remove(from);
    items.insert(to, item);
    for (i, it) in items.iter_mut().enumerate() {
        set_order(it, i);
    }
}

// ── Factors ──

/// Factors in display order. `order` always equals the position in the list.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct FactorBook {
    factors: Vec<Factor>,
}

impl FactorBook {
    pub fn from_factors(mut factors: Vec<Factor>) -> Self {
        factors.sort_by_key(|f| f.order);
        for (i, f) in factors.iter_mut().enumerate() {
            f.order = i;
        }
        Self { factors }
    }

    pub fn all(&self) -> &[Factor] {
        &self.factors
    }

    pub fn get(&self, id: &str) -> Option<&Factor> {
        self.factors.iter().find(|f| f.id == id)
    }

    pub fn selected(&self) -> impl Iterator<Item = &Factor> {
        self.factors.iter().filter(|f| f.selected)
    }

    fn position(&self, id: &str) -> JournalResult<usize> {
        self.factors
            .iter()
            .position(|f| f.id == id)
            .ok_or_else(|| JournalError::not_found("factor", id))
    }

    fn ensure_unique(&self, name: &str, except: Option<&str>) -> JournalResult<()> {
        let clash = self
            .factors
            .iter()
            .any(|f| f.name.eq_ignore_ascii_case(name) && Some(f.id.as_str()) != except);
        if clash {
            return Err(JournalError::Validation(format!("factor '{name}' already exists")));
        }
        Ok(())
    }

    pub fn add(&mut self, name: &str) -> JournalResult<&Factor> {
        let name = clean_name(name)?;
        self.ensure_unique(&name, None)?;
        let order = self.factors.len();
        self.factors.push(Factor { id: new_id(), name, selected: false, order });
        Ok(&self.factors[order])
    }

    /// Rename in place and return the previous name.
    pub fn rename(&mut self, id: &str, name: &str) -> JournalResult<String> {
        let name = clean_name(name)?;
        let idx = self.position(id)?;
        self.ensure_unique(&name, Some(id))?;
        Ok(std::mem::replace(&mut self.factors[idx].name, name))
    }

    pub fn set_selected(&mut self, id: &str, selected: bool) -> JournalResult<()> {
        let idx = self.position(id)?;
        self.factors[idx].selected = selected;
        Ok(())
    }

    pub fn select_all(&mut self, selected: bool) {
        for f in &mut self.factors {
            f.selected = selected;
        }
    }

    pub fn move_to(&mut self, id: &str, index: usize) -> JournalResult<()> {
        let from = self.position(id)?;
        reorder(&mut self.factors, from, index, |f, i| f.order = i);
        Ok(())
    }

    /// Remove a factor and compact the `order` of the survivors.
    pub fn delete(&mut self, id: &str) -> JournalResult<Factor> {
        let idx = self.position(id)?;
        let removed = self.factors.remove(idx);
        for (i, f) in self.factors.iter_mut().enumerate() {
            f.order = i;
        }
        Ok(removed)
    }
}

/// Test-mode keys are factor ids; names are looked up at call time.
impl NameResolver for FactorBook {
    fn factor_names(&self, key: &ModelKey) -> Vec<String> {
        key.parts()
            .map(|id| {
                self.get(id)
                    .map(|f| f.name.clone())
                    .unwrap_or_else(|| DELETED_FACTOR.to_string())
            })
            .collect()
    }
}

// ── Models ──

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ModelBook {
    models: Vec<Model>,
}

impl ModelBook {
    pub fn from_models(mut models: Vec<Model>) -> Self {
        models.sort_by_key(|m| m.order);
        for (i, m) in models.iter_mut().enumerate() {
            m.order = i;
        }
        Self { models }
    }

    pub fn all(&self) -> &[Model] {
        &self.models
    }

    pub fn get(&self, id: &str) -> Option<&Model> {
        self.models.iter().find(|m| m.id == id)
    }

    fn position(&self, id: &str) -> JournalResult<usize> {
        self.models
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| JournalError::not_found("model", id))
    }

    fn clean_factors(factors: &[String]) -> JournalResult<Vec<String>> {
        let mut out: Vec<String> = Vec::with_capacity(factors.len());
        for raw in factors {
            let name = clean_name(raw)?;
            if !out.contains(&name) {
                out.push(name);
            }
        }
        if out.is_empty() {
            return Err(JournalError::Validation("a model needs at least one factor".into()));
        }
        Ok(out)
    }

    pub fn add(&mut self, name: &str, factors: &[String]) -> JournalResult<&Model> {
        let name = clean_name(name)?;
        let factors = Self::clean_factors(factors)?;
        let order = self.models.len();
        self.models.push(Model { id: new_id(), name, factors, order });
        Ok(&self.models[order])
    }

    pub fn update(&mut self, id: &str, name: &str, factors: &[String]) -> JournalResult<()> {
        let idx = self.position(id)?;
        let name = clean_name(name)?;
        let factors = Self::clean_factors(factors)?;
        let model = &mut self.models[idx];
        model.name = name;
        model.factors = factors;
        Ok(())
    }

    pub fn move_to(&mut self, id: &str, index: usize) -> JournalResult<()> {
        let from = self.position(id)?;
        reorder(&mut self.models, from, index, |m, i| m.order = i);
        Ok(())
    }

    pub fn delete(&mut self, id: &str) -> JournalResult<Model> {
        let idx = self.position(id)?;
        let removed = self.models.remove(idx);
        for (i, m) in self.models.iter_mut().enumerate() {
            m.order = i;
        }
        Ok(removed)
    }

    /// Follow a factor rename into every model that lists the old name.
    /// Returns how many models changed.
    pub fn rename_factor(&mut self, old: &str, new: &str) -> usize {
        let mut changed = 0;
        for model in &mut self.models {
            let mut touched = false;
            for f in model.factors.iter_mut().filter(|f| f.as_str() == old) {
                *f = new.to_string();
                touched = true;
            }
            if touched {
                changed += 1;
            }
        }
        changed
    }
}

/// Live-mode keys are single model ids.
impl NameResolver for ModelBook {
    fn factor_names(&self, key: &ModelKey) -> Vec<String> {
        self.get(key.as_str())
            .map(|m| m.factors.clone())
            .unwrap_or_else(|| vec![DELETED_MODEL.to_string()])
    }

    fn label(&self, key: &ModelKey) -> String {
        self.get(key.as_str())
            .map(|m| m.name.clone())
            .unwrap_or_else(|| DELETED_MODEL.to_string())
    }
}
