use criterion::{criterion_group, criterion_main, Criterion};
use enclave_session::{
    AttestationProtocol, EnclaveProvider, ParameterGenerator, ProviderConfig, SimulatedEnclave,
};

const SERVER: &str = "sql.example.com";
const URL: &str = "https://attest.example.com/enclave";

fn provider_for(enclave: &SimulatedEnclave) -> EnclaveProvider {
    let config = ProviderConfig {
        protocol: enclave.protocol(),
        policy: enclave.policy(),
        ..ProviderConfig::default()
    };
    EnclaveProvider::new(&config).unwrap()
}

fn bench_establishment(c: &mut Criterion) {
    let generator = ParameterGenerator::default();
    c.bench_function("generate_parameters", |b| {
        b.iter(|| generator.generate(AttestationProtocol::AuthorityToken).unwrap())
    });

    let rt = tokio::runtime::Runtime::new().unwrap();

    for protocol in [AttestationProtocol::AuthorityToken, AttestationProtocol::HostHealth] {
        let enclave = SimulatedEnclave::new(protocol, URL);
        let provider = provider_for(&enclave);
        c.bench_function(&format!("establish_{}", protocol.name()), |b| {
            b.iter(|| {
                let params = provider.get_attestation_parameters(protocol).unwrap();
                let evidence = enclave.respond(&params.to_bytes()).unwrap();
                let (session, _) = rt
                    .block_on(provider.create_enclave_session(
                        &evidence,
                        params.into_key_pair(),
                        URL,
                        SERVER,
                    ))
                    .unwrap();
                provider.invalidate_enclave_session(SERVER, URL, &session);
            })
        });
    }

    let enclave = SimulatedEnclave::new(AttestationProtocol::HostHealth, URL);
    let provider = provider_for(&enclave);
    rt.block_on(provider.establish_session(SERVER, URL, &enclave))
        .unwrap();
    c.bench_function("cached_session_lookup", |b| {
        b.iter(|| provider.get_enclave_session(SERVER, URL))
    });
}

criterion_group!(benches, bench_establishment);
criterion_main!(benches);
