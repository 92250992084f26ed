use epi_core::models::{
    boarding_school_params, closed_sir, final_size, r0_from_final_size, rainfall_forced_sir,
};
use epi_core::{
    integrate, integrate_batch, BatchMember, BatchSettings, CovariateSeries, CovariateTable,
    IntegratorSettings, ModelDefinition, ModelDefinitionError, ParameterVector, Trajectory,
};

fn daily(days: usize) -> Vec<f64> {
    (0..=days).map(|d| d as f64).collect()
}

fn boarding_school(times: &[f64]) -> Trajectory {
    integrate(
        &closed_sir().expect("closed SIR should build"),
        &boarding_school_params(),
        0.0,
        times,
        None,
        &IntegratorSettings::default(),
    )
    .expect("boarding school outbreak should integrate")
}

#[test]
fn closed_sir_conserves_population() {
    let traj = boarding_school(&daily(120));
    for (t, total) in traj.times().iter().zip(traj.totals()) {
        assert!((total - 763.0).abs() < 1e-6, "t = {t}: S+I+R = {total}");
    }
}

#[test]
fn infections_stay_non_negative_and_settle() {
    let times: Vec<f64> = (0..=400).map(|d| d as f64 * 0.5).collect();
    let traj = boarding_school(&times);
    let infected = traj.variable("I").expect("I is a state");
    assert!(infected.iter().all(|&i| i >= 0.0 && i.is_finite()));

    let peak = infected.iter().cloned().fold(f64::MIN, f64::max);
    assert!(peak > 100.0 && peak < 763.0, "peak {peak}");

    let last = *infected.last().unwrap();
    assert!(last < 1e-2, "I(200) = {last}");

    // Long after the peak the epidemic has burnt out and keeps shrinking.
    let tail = &infected[infected.len() - 20..];
    assert!(tail.windows(2).all(|w| w[1] <= w[0]));
}

#[test]
fn final_size_matches_reproduction_number() {
    let traj = boarding_school(&[400.0]);
    let s_inf = traj.final_state().unwrap()[0];
    let f = 1.0 - s_inf / 763.0;
    let r0_computed = r0_from_final_size(f).expect("fraction in (0, 1)");
    // The single initial case makes S(0) slightly below N, so allow a small gap.
    assert!((r0_computed - 13.0).abs() < 0.05, "R0 = {r0_computed}");

    let predicted = final_size(13.0).unwrap();
    assert!((predicted - f).abs() < 1e-3);
}

#[test]
fn repeated_integration_is_bit_identical() {
    let first = boarding_school(&daily(60));
    let second = boarding_school(&daily(60));
    assert_eq!(first, second);
}

#[test]
fn batch_matches_individual_runs() {
    let model = closed_sir().unwrap();
    let settings = IntegratorSettings::default();
    let times = daily(30);
    let p1 = boarding_school_params();
    let p2 = boarding_school_params().with("Beta", 0.6).with("gamma", 0.2);

    let members = vec![BatchMember::new(p1.clone()), BatchMember::new(p2.clone())];
    for threads in [1, 2] {
        let batch = integrate_batch(
            &model,
            &members,
            0.0,
            &times,
            None,
            &settings,
            &BatchSettings {
                threads,
                ..BatchSettings::default()
            },
        );
        assert!(batch.all_succeeded());
        for (idx, params) in [p1.clone(), p2.clone()].iter().enumerate() {
            let single = integrate(&model, params, 0.0, &times, None, &settings).unwrap();
            assert_eq!(batch.results()[idx].as_ref().unwrap(), &single);
        }
    }
}

#[test]
fn vector_field_length_mismatch_fails_at_construction() {
    let err = ModelDefinition::builder("broken_sir")
        .states(["S", "I", "R"])
        .params(["Beta", "gamma"])
        .vector_field_fn(|_t, x, p, _c| {
            let infection = p[0] * x[0] * x[1];
            vec![-infection, infection - p[1] * x[1]]
        })
        .initializer(|_p| vec![762.0, 1.0, 0.0])
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        ModelDefinitionError::DimensionMismatch {
            expected: 3,
            actual: 2,
            ..
        }
    ));
}

#[test]
fn rainfall_drives_transmission() {
    let model = rainfall_forced_sir().unwrap();
    let params = ParameterVector::new()
        .with("Beta", 0.3)
        .with("alpha", 1.0)
        .with("gamma", 0.2)
        .with("mu", 0.0)
        .with("N", 1000.0)
        .with("S_0", 990.0)
        .with("I_0", 10.0)
        .with("R_0", 0.0);
    let times = daily(20);
    let settings = IntegratorSettings::default();

    let run = |values: Vec<f64>| {
        let table = CovariateTable::new().with(
            "rainfall",
            CovariateSeries::new(vec![0.0, 10.0, 20.0], values).unwrap(),
        );
        integrate(&model, &params, 0.0, &times, Some(&table), &settings).unwrap()
    };

    let dry = run(vec![0.0, 0.0, 0.0]);
    let wet = run(vec![1.0, 1.0, 1.0]);
    let dry_i = dry.final_state().unwrap()[1];
    let wet_i = wet.final_state().unwrap()[1];
    assert!(wet_i > dry_i, "wet {wet_i} vs dry {dry_i}");

    // Rain arriving halfway leaves the first ten days unchanged.
    let late = run(vec![0.0, 0.0, 1.0]);
    let day = 10;
    assert!((late.state(day).unwrap()[1] - dry.state(day).unwrap()[1]).abs() < 1e-3);
    assert!(late.final_state().unwrap()[1] > dry_i);
}
