use crate::{
    cell::{AnyCell, Cell, CellValue, Value},
    engine::{Engine, EngineConfig},
    error::EngineError,
    stream::CellStream,
    types::BoxError,
};
use std::future::Future;

/// Fluent construction facade over an [`Engine`].
///
/// Accumulates the cells created so far; `add_function` consumes the
/// accumulated list as its dependencies and replaces it with the new cell,
/// so chained calls build a pipeline without naming intermediate handles.
#[must_use]
#[derive(Debug)]
pub struct GraphBuilder {
    engine: Engine,
    current: Vec<AnyCell>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    /// Builder over a fresh engine with the default configuration.
    pub fn new() -> Self {
        Self::with_engine(Engine::new())
    }

    /// Builder over a fresh engine with an explicit configuration.
    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_engine(Engine::with_config(config))
    }

    /// Builder over an existing engine.
    pub fn with_engine(engine: Engine) -> Self {
        Self {
            engine,
            current: Vec::new(),
        }
    }

    /// The underlying engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Create an input cell and append it to the accumulated list.
    pub fn add_input<T: CellValue>(&mut self, value: T) -> Result<Cell<T>, EngineError> {
        let cell = self.engine.add_input(value)?;
        self.current.push(cell.into());
        Ok(cell)
    }

    /// Create a function cell whose dependencies are the accumulated
    /// cells, then replace the list with just the new cell.
    pub fn add_function<T, F, Fut>(&mut self, f: F) -> Result<Cell<T>, EngineError>
    where
        T: CellValue,
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        let deps = std::mem::take(&mut self.current);
        match self.engine.add_function_any(&deps, f) {
            Ok(cell) => {
                self.current = vec![cell.into()];
                Ok(cell)
            }
            Err(err) => {
                self.current = deps;
                Err(err)
            }
        }
    }

    /// Create a function cell with explicit dependencies, then replace the
    /// accumulated list with just the new cell.
    pub fn add_function_with<T, F, Fut>(
        &mut self,
        deps: &[AnyCell],
        f: F,
    ) -> Result<Cell<T>, EngineError>
    where
        T: CellValue,
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        let cell = self.engine.add_function_any(deps, f)?;
        self.current = vec![cell.into()];
        Ok(cell)
    }

    /// Create a function cell yielding the values of `cells` in order.
    pub fn combine<T: CellValue>(
        &mut self,
        cells: &[Cell<T>],
    ) -> Result<Cell<Vec<T>>, EngineError> {
        let cell = self
            .engine
            .add_function(cells, |values: Vec<T>| async move {
                Ok::<_, BoxError>(values)
            })?;
        self.current = vec![cell.into()];
        Ok(cell)
    }

    /// Forwarded to [`Engine::update_input`].
    pub async fn update_input<T: CellValue>(
        &self,
        cell: Cell<T>,
        value: T,
    ) -> Result<(), EngineError> {
        self.engine.update_input(cell, value).await
    }

    /// Forwarded to [`Engine::get_result`].
    pub async fn get_result<T: CellValue>(&self, cell: Cell<T>) -> Result<T, EngineError> {
        self.engine.get_result(cell).await
    }

    /// Forwarded to [`Engine::stream`].
    pub fn stream<T: CellValue>(&self, cell: Cell<T>) -> Result<CellStream<T>, EngineError> {
        self.engine.stream(cell)
    }

    /// Forwarded to [`Engine::to_json`].
    #[must_use]
    pub fn to_json(&self) -> String {
        self.engine.to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chained_functions_consume_the_accumulated_cells() {
        let mut builder = GraphBuilder::new();
        let a = builder.add_input(3_i64).unwrap();
        let _b = builder.add_input(4_i64).unwrap();
        let sum = builder
            .add_function(|values: Vec<Value>| async move {
                let mut acc = 0_i64;
                for value in &values {
                    acc += value.downcast::<i64>()?;
                }
                Ok::<_, BoxError>(acc)
            })
            .unwrap();
        let doubled = builder
            .add_function(|values: Vec<Value>| async move {
                Ok::<_, BoxError>(values[0].downcast::<i64>()? * 2)
            })
            .unwrap();

        assert_eq!(builder.get_result(sum).await.unwrap(), 7);
        assert_eq!(builder.get_result(doubled).await.unwrap(), 14);

        builder.update_input(a, 10).await.unwrap();
        assert_eq!(builder.get_result(doubled).await.unwrap(), 28);
    }

    #[tokio::test]
    async fn combine_yields_dependency_values_in_order() {
        let mut builder = GraphBuilder::new();
        let a = builder.add_input(1_i64).unwrap();
        let b = builder.add_input(2_i64).unwrap();
        let tuple = builder.combine(&[a, b]).unwrap();
        assert_eq!(builder.get_result(tuple).await.unwrap(), vec![1, 2]);
    }
}
